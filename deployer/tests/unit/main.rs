//! Unit tests for the deployer

mod support;

mod test_drivers;
mod test_reconciler;
mod test_state_store;
