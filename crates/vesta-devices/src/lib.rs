#![forbid(unsafe_code)]

pub mod i8254;
pub mod output;

pub use i8254::{register_i8254, I8254Port, SharedI8254, I8254};
pub use output::{EdgeSink, NoEdge};
