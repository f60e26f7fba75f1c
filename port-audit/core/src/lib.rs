#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod diff;
pub mod flow;
pub mod format;
pub mod matrix;

pub use self::{
    diff::MatrixDiff,
    flow::{Direction, DynamicRange, FlowKey, FlowRecord, Protocol},
    format::{Format, ParseError},
    matrix::FlowMatrix,
};

/// Column names shared by every matrix encoding, in canonical field order.
pub const COLUMNS: [&str; 9] = [
    "Direction",
    "Protocol",
    "Port",
    "Namespace",
    "Service",
    "Pod",
    "Container",
    "NodeGroup",
    "Optional",
];
