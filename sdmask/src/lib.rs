pub mod config;
pub mod error;
pub mod table;
pub mod clean;
pub mod lines;
pub mod maskline;

// Re-export commonly used types
pub use config::{MaskLineConfig, Pattern, WindowMode};
pub use error::{Error, Result};
pub use lines::merge_lines;
pub use maskline::{run_members_par, MaskLine, MaskLineResult, MaskSource, MemberJob};
pub use table::{DataTable, InMemoryTable, SampleMask, NO_LINE};
