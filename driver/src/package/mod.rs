// Licensed under the Apache-2.0 license

pub mod parser;
pub mod reader;
pub mod tags;

pub use parser::*;
pub use reader::*;
pub use tags::*;
