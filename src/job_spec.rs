use chrono::Utc;
use derive_builder::Builder;
use getset::{Getters, MutGetters, Setters};

/// Queue a job lands in when the spec does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Options for deferring a job.
///
/// Everything is optional: an empty spec defers to the default queue, ready
/// to run immediately, with no locks.
#[derive(Getters, Setters, MutGetters, Debug, Default, Clone, Builder)]
#[getset(get = "pub", set = "pub", get_mut = "pub")]
#[builder(
    build_fn(private, name = "build_internal"),
    setter(strip_option),
    default,
    pattern = "owned"
)]
pub struct DeferSpec {
    /// Queue the job is routed to (default: `default`)
    #[builder(setter(into))]
    pub queue_name: Option<String>,

    /// Earliest time the job may be fetched; `None` means immediately
    #[builder(setter(into))]
    pub scheduled_at: Option<chrono::DateTime<Utc>>,

    /// Execution lock: while a `doing` job holds this key, other jobs with
    /// the same key stay in the ready set
    #[builder(setter(into))]
    pub lock: Option<String>,

    /// Admission lock: deferring fails with `AlreadyEnqueued` while a
    /// `todo` or `doing` job holds the same key
    #[builder(setter(into))]
    pub queueing_lock: Option<String>,
}

impl DeferSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> DeferSpecBuilder {
        DeferSpecBuilder::new()
    }
}

impl DeferSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> DeferSpec {
        self.build_internal()
            .expect("There is a default value for all fields")
    }
}

impl From<Option<DeferSpec>> for DeferSpec {
    fn from(spec: Option<DeferSpec>) -> Self {
        spec.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defer_spec() {
        let now = Utc::now();
        let spec = DeferSpecBuilder::new()
            .queue_name("emails")
            .scheduled_at(now)
            .lock("user:7")
            .queueing_lock("user:7:email")
            .build();

        assert_eq!(spec.queue_name(), &Some("emails".to_string()));
        assert_eq!(spec.scheduled_at(), &Some(now));
        assert_eq!(spec.lock(), &Some("user:7".to_string()));
        assert_eq!(spec.queueing_lock(), &Some("user:7:email".to_string()));
    }

    #[test]
    fn should_build_unset_defer_spec_without_panic() {
        let spec = DeferSpecBuilder::new().build();
        assert_eq!(spec.queue_name(), &None);
        assert_eq!(spec.scheduled_at(), &None);
    }
}
