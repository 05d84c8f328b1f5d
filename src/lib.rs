use std::error::Error;

pub mod cli;
pub mod clippings;
pub mod config;
pub mod db;
pub mod devices;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod readwise;

pub use error::ExportError;

/// Joins an error and its `source()` chain into one `outer: inner: root` line.
pub fn error_chain(err: &(dyn Error + 'static)) -> String {
    std::iter::successors(Some(err), |e| (*e).source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

