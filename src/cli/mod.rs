pub mod commands;
pub mod ui;
pub mod util;

pub use util::{CommandContext, load_config, load_retriever, open_report_db, read_input};
