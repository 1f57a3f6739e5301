use derive_builder::Builder;
use getset::{Getters, MutGetters, Setters};

use crate::delay::Delay;

/// Options for a single push.
///
/// ```
/// use rabbit_worker::PushOptionsBuilder;
///
/// let options = PushOptionsBuilder::new()
///     .queue("emails")
///     .priority(10)
///     .delay(30)
///     .build();
/// ```
#[derive(Getters, Setters, MutGetters, Debug, Default, Clone, PartialEq, Builder)]
#[getset(get = "pub", set = "pub", get_mut = "pub")]
#[builder(
    build_fn(private, name = "build_internal"),
    setter(strip_option),
    default,
    pattern = "owned"
)]
pub struct PushOptions {
    /// Publish into this queue instead of the one the queue connection is bound to.
    ///
    /// A delayed push uses it as the routing key on the delayed exchange.
    #[builder(setter(into))]
    pub queue: Option<String>,

    /// Message priority, clamped into 0..=255.
    ///
    /// A job that declares its own priority overrides this value.
    pub priority: Option<i64>,

    /// Hold the message on the delayed exchange before it reaches the queue.
    ///
    /// Without a delayed exchange configured the message is delivered right
    /// away and the delay is ignored.
    #[builder(setter(into))]
    pub delay: Option<Delay>,
}

impl PushOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> PushOptionsBuilder {
        PushOptionsBuilder::new()
    }
}

impl PushOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(self) -> PushOptions {
        self.build_internal()
            .expect("There is a default value for all fields")
    }
}

impl From<Option<PushOptions>> for PushOptions {
    fn from(options: Option<PushOptions>) -> Self {
        options.unwrap_or_default()
    }
}
