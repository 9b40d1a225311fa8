//! Configuration Module
//!
//! Command-line and environment configuration for the binaries.

mod settings;

pub use settings::{
    BenchArgs, CommonArgs, ParseValueError, PublisherArgs, SubscriberArgs, load_dotenv,
    parse_duration, parse_size,
};
