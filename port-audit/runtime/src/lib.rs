#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
pub mod artifacts;
pub mod report;

pub use self::{
    args::Args,
    artifacts::{ArtifactDir, WriteArtifact},
    report::{Report, Summary},
};
