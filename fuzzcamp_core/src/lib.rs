pub mod campaign;
pub mod config;
pub mod corpus;
pub mod executor;
pub mod job;
pub mod normalizer;
pub mod oracle;
pub mod registry;

pub use campaign::{Campaign, CampaignError, CampaignOutcome, CampaignSettings};
pub use config::{CampaignConfig, ReclaimPolicy};
pub use corpus::{ArtifactReclaimer, ReclaimError};
pub use executor::{BuildSpec, CommandRuntime, ContainerRuntime, ImageHandle, RuntimeError};
pub use job::{JobInvocation, JobReport, JobRunner, JobSettings};
pub use normalizer::{CommandHarness, NormalizeError, NormalizedArtifactBundle, TxLogNormalizer};
pub use oracle::{JobVerdict, OutcomeOracle, PassMarkerOracle};
pub use registry::{RegistryError, SetupRegistry, TargetEntry, TargetRegistry};
