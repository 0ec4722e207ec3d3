mod cdr;
mod config;
mod contexts;
mod packet_filter;

pub use cdr::*;
pub use config::*;
pub use contexts::*;
pub use packet_filter::*;
