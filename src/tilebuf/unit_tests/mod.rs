#[cfg(test)]
mod power_tests;
#[cfg(test)]
mod subsystem_tests;
