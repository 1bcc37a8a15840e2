#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod status;
mod table;
