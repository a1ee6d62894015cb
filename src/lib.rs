pub mod cli;
pub mod data;
pub mod embedding;
pub mod error;
pub mod lr_schedule;
pub mod model;
pub mod pipeline;
pub mod publish;
pub mod tracking;
pub mod train;
