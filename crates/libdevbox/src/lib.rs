pub mod backup;
pub mod config;
pub mod credential;
pub mod error;
pub mod idle;
pub mod persist;
pub mod probe;
pub mod provision;
pub mod supervisor;

pub use backup::{Archiver, BackupGuard, BackupPlan, RestoreOutcome, TarArchiver};
pub use config::{Endpoint, FileConfig, Overrides, SessionConfig};
pub use credential::{Credential, CredentialSource, InjectOutcome};
pub use error::{DevboxError, Result};
pub use idle::{IdlePhase, IdleState, IdleTracker, MonitorExit};
pub use persist::{LinkAction, LinkReport, PersistItem, PersistProfile, PersistenceBinding};
pub use probe::{ActivityProbe, ProcessProbe, ScriptedProbe};
pub use supervisor::{RunningSession, SessionReport, SessionSupervisor, StartReport};
