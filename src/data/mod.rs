mod batcher;
mod class_weights;
mod dataset;
mod split;
mod tokenizer;

pub use batcher::*;
pub use class_weights::*;
pub use dataset::*;
pub use split::*;
pub use tokenizer::*;
