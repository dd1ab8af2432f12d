mod format;
mod intfmt;

pub use format::{format_duration, human_bytes, human_count, print_about, progress_bar};
pub use intfmt::{parse_int, push_i64, push_u32, push_u64, trim_ascii};
