/// Marker the fuzz tool prints once every property held for the whole run.
pub const DEFAULT_PASS_MARKER: &str = "passed!";

/// Outcome of one fuzz job. There is no partial state: anything that is not a
/// reported pass is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobVerdict {
    Passed,
    Failed,
}

impl JobVerdict {
    pub fn is_pass(self) -> bool {
        self == JobVerdict::Passed
    }
}

/// An `OutcomeOracle` decides whether a fuzz job passed by looking at what the
/// tool printed.
///
/// The decision is a pure function of the captured text. Exit codes are not
/// consulted: the fuzz tool can exit 0 while reporting broken properties.
pub trait OutcomeOracle {
    /// Classifies the combined stdout/stderr of one job.
    fn classify(&self, output: &str) -> JobVerdict;
}

/// Passes a job iff a fixed marker appears anywhere in its output.
#[derive(Debug, Clone)]
pub struct PassMarkerOracle {
    marker: String,
}

impl PassMarkerOracle {
    /// Creates an oracle matching `marker`. An empty marker would match every
    /// output, so callers validate it first (see `CampaignConfig::validate`).
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl Default for PassMarkerOracle {
    fn default() -> Self {
        Self::new(DEFAULT_PASS_MARKER)
    }
}

impl OutcomeOracle for PassMarkerOracle {
    fn classify(&self, output: &str) -> JobVerdict {
        if output.contains(&self.marker) {
            JobVerdict::Passed
        } else {
            JobVerdict::Failed
        }
    }
}

/// Classifies `output` with the default `"passed!"` marker.
pub fn classify(output: &str) -> JobVerdict {
    PassMarkerOracle::default().classify(output)
}
