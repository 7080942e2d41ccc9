mod menu;
mod wizard;

pub use menu::{print_results, run_all, run_menu};
