mod commands;
mod layout;
mod report;

pub(crate) use commands::dispatch;
pub(crate) use layout::locate_project_root;
