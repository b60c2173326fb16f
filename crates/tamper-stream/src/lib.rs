mod chunked_regex;
mod circular;
mod split;
mod throttle;

pub use chunked_regex::ChunkedRegexReader;
pub use circular::DynamicCircularBuffer;
pub use split::{buffered_split, SplitReader};
pub use throttle::{ThrottleController, ThrottledReader, GIGABIT, KILOBIT, MEGABIT};
