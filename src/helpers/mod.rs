pub mod external_command;
pub mod retry;
