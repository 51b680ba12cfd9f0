/*!
# Homewatch DevKit

Test tooling for the Homewatch bridge:
- an in-memory `DocumentStore` with a write journal and failure injection
- payload builders matching the sensor firmware
- a harness driving the pipeline and the connection supervisor without a broker
*/

pub mod mock_store;
pub mod payloads;
pub mod test_utils;

pub use mock_store::{MockStore, WriteOp, WriteRecord};
pub use payloads::PayloadBuilder;
pub use test_utils::{Fed, TestHarness};
