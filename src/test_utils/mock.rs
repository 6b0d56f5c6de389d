//! Type config wired to the mockall doubles.

use crate::EwmaFailureDetector;
use crate::MockConfigurationStorage;
use crate::MockPersistentLog;
use crate::MockTransport;
use crate::TypeConfig;

/// Adapter bundle backed by mocks, for handler-level unit tests.
#[derive(Clone, Debug)]
pub struct MockTypeConfig;

impl TypeConfig for MockTypeConfig {
    type Log = MockPersistentLog;
    type Transport = MockTransport;
    type ConfigStorage = MockConfigurationStorage;
    type Detector = EwmaFailureDetector;
}
