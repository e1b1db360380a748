pub mod async_task;
pub mod file_io;
pub mod time;

#[cfg(test)]
mod file_io_test;
