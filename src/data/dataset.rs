use std::fmt;
use std::path::PathBuf;

use burn::data::dataset::{Dataset, InMemDataset};
use serde::{Deserialize, Serialize};

pub const REVIEWS_URL: &str = "https://full-stack-assets.s3.eu-west-3.amazonaws.com/images/M08-DeepLearning/NLP/french_review_clean.csv";

pub const TEXT_COLUMN: &str = "review_format";
pub const RATING_COLUMN: &str = "stars";

/// Number of distinct star ratings, one class per rating.
pub const NUM_CLASSES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("failed to download reviews from {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("reviews request to {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed review CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("review CSV has no `{0}` column")]
    MissingColumn(&'static str),
    #[error("row {row} has rating {stars}, expected 1..=5")]
    InvalidRating { row: usize, stars: i64 },
    #[error("row {row} has rating `{value}`, expected a whole number of stars")]
    MalformedRating { row: usize, value: String },
    #[error("dataset contains no reviews")]
    EmptyDataset,
    #[error("no review has label {label} although higher labels are present")]
    MissingClass { label: usize },
}

/// Where the labeled reviews come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    Url(String),
    File(PathBuf),
}

impl DatasetSource {
    /// `http(s)://` locations are fetched, anything else is read from disk.
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Url(location.to_string())
        } else {
            Self::File(PathBuf::from(location))
        }
    }
}

impl Default for DatasetSource {
    fn default() -> Self {
        Self::Url(REVIEWS_URL.to_string())
    }
}

impl fmt::Display for DatasetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReviewRecord {
    pub review_format: String,
    pub stars: u8,
}

impl ReviewRecord {
    pub fn new(review_format: impl Into<String>, stars: u8) -> Self {
        Self {
            review_format: review_format.into(),
            stars,
        }
    }

    /// Zero-indexed class of the rating.
    pub fn label(&self) -> usize {
        self.stars as usize - 1
    }
}

#[derive(Clone, Debug)]
pub struct ReviewClassificationItem {
    pub label: usize,
    pub text: String,
}

impl ReviewClassificationItem {
    pub fn new(label: usize, text: String) -> ReviewClassificationItem {
        return Self { label, text };
    }
}

impl From<ReviewRecord> for ReviewClassificationItem {
    fn from(record: ReviewRecord) -> Self {
        Self::new(record.label(), record.review_format)
    }
}

/// The downloaded table: every raw column, plus the typed review records.
///
/// Raw columns are kept because the published model signature describes the
/// whole frame.
#[derive(Debug, Clone)]
pub struct ReviewFrame {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub records: Vec<ReviewRecord>,
}

impl ReviewFrame {
    pub fn load(source: &DatasetSource) -> Result<Self, DataError> {
        log::info!("Loading reviews from {source}");
        let bytes = match source {
            DatasetSource::Url(url) => download(url)?,
            DatasetSource::File(path) => std::fs::read(path).map_err(|source| DataError::Io {
                path: path.clone(),
                source,
            })?,
        };
        let frame = Self::from_reader(bytes.as_slice())?;
        log::info!("Loaded {} reviews", frame.len());
        Ok(frame)
    }

    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self, DataError> {
        let mut reader = csv::ReaderBuilder::new().flexible(false).from_reader(reader);
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

        let text_index = column_index(&headers, TEXT_COLUMN)?;
        let rating_index = column_index(&headers, RATING_COLUMN)?;

        let mut rows = Vec::new();
        let mut records = Vec::new();
        for (row, result) in reader.records().enumerate() {
            let record = result?;
            let stars = parse_rating(&record[rating_index], row)?;
            records.push(ReviewRecord::new(&record[text_index], stars));
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self {
            headers,
            rows,
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = usize> + '_ {
        self.records.iter().map(ReviewRecord::label)
    }

    /// Values of one raw column, in row order.
    pub fn column(&self, index: usize) -> impl Iterator<Item = &str> + '_ {
        self.rows.iter().map(move |row| row[index].as_str())
    }
}

fn download(url: &str) -> Result<Vec<u8>, DataError> {
    let response = reqwest::blocking::get(url).map_err(|source| DataError::Download {
        url: url.to_string(),
        source,
    })?;
    log::debug!("Reviews response status: {}", response.status());
    if !response.status().is_success() {
        return Err(DataError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    let bytes = response.bytes().map_err(|source| DataError::Download {
        url: url.to_string(),
        source,
    })?;
    log::debug!("Downloaded {} bytes of reviews", bytes.len());
    Ok(bytes.to_vec())
}

fn column_index(headers: &[String], name: &'static str) -> Result<usize, DataError> {
    headers
        .iter()
        .position(|header| header == name)
        .ok_or(DataError::MissingColumn(name))
}

fn parse_rating(value: &str, row: usize) -> Result<u8, DataError> {
    let raw = value.trim();
    let not_a_rating = || DataError::MalformedRating {
        row,
        value: raw.to_string(),
    };
    // Ratings are sometimes exported as floats ("4.0"), but never fractional.
    let stars = match raw.parse::<i64>() {
        Ok(stars) => stars,
        Err(_) => {
            let stars = raw.parse::<f64>().map_err(|_| not_a_rating())?;
            if !stars.is_finite() || stars.fract() != 0.0 {
                return Err(not_a_rating());
            }
            stars as i64
        }
    };
    if (1..=NUM_CLASSES as i64).contains(&stars) {
        Ok(stars as u8)
    } else {
        Err(DataError::InvalidRating { row, stars })
    }
}

pub struct ReviewDataset {
    dataset: InMemDataset<ReviewClassificationItem>,
}

impl Dataset<ReviewClassificationItem> for ReviewDataset {
    fn get(&self, index: usize) -> Option<ReviewClassificationItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl ReviewDataset {
    pub fn new(records: Vec<ReviewRecord>) -> Self {
        let items = records.into_iter().map(Into::into).collect();
        Self {
            dataset: InMemDataset::new(items),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.dataset.iter().map(|item| item.text).collect()
    }
}
