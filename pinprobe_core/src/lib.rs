pub mod cancel;
pub mod candidate;
pub mod config;
pub mod driver;
pub mod encoding;
pub mod executor;
pub mod length;
pub mod observer;
pub mod oracle;
pub mod report;
pub mod selector;

pub use cancel::CancellationToken;
pub use candidate::{Candidate, Score};
pub use config::{Arch, CountMode, HarnessPaths, PinprobeConfig, ProbeConfig};
pub use driver::{
    DriverError, KnownMap, Order, Resolver, RunOutcome, RunReport, Strategy,
};
pub use encoding::TextEncoding;
pub use executor::{BatchError, BatchExecutor, ExecutionMode};
pub use length::{LengthOutcome, LengthReport, LengthSearch, detect_length};
pub use observer::{NoOpObserver, ProgressObserver};
pub use oracle::{FnOracle, Oracle, OracleError, OracleResult, PinOracle};
pub use report::ReportDocument;
pub use selector::{SelectMode, Selection, select};
