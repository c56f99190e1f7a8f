pub mod dashboard;
pub mod device;
pub mod load_worker;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
pub mod testing;
