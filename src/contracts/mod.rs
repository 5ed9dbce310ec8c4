pub mod outcome;
pub mod work_item;

pub use outcome::{Outcome, Terminal};
pub use work_item::WorkItem;
