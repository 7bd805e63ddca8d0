//! ClientHello rewrites. Strategies only touch the model they are given.

use rand::Rng;

use crate::config::{ObfuscationConfig, PaddingConfig};
use crate::tls::ClientHello;

pub const DEFAULT_PADDING: u16 = 256;

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, hello: &mut ClientHello);
}

pub struct RemoveSni;

impl Strategy for RemoveSni {
    fn name(&self) -> &'static str {
        "remove-sni"
    }

    fn apply(&self, hello: &mut ClientHello) {
        hello.remove_sni();
    }
}

pub struct FixedPadding(pub u16);

impl Strategy for FixedPadding {
    fn name(&self) -> &'static str {
        "fixed-padding"
    }

    fn apply(&self, hello: &mut ClientHello) {
        hello.add_padding(self.0);
    }
}

/// Pads every hello to a different length so the record size is not a
/// fingerprint of its own.
pub struct RandomPadding {
    pub min: u16,
    pub max: u16,
}

impl Strategy for RandomPadding {
    fn name(&self) -> &'static str {
        "random-padding"
    }

    fn apply(&self, hello: &mut ClientHello) {
        let size = rand::thread_rng().gen_range(self.min..=self.max);
        hello.add_padding(size);
    }
}

/// Applies each strategy in order.
pub struct Chain(Vec<Box<dyn Strategy>>);

impl Chain {
    pub fn new(steps: Vec<Box<dyn Strategy>>) -> Self {
        Self(steps)
    }

    pub fn describe(&self) -> String {
        if self.0.is_empty() {
            return "identity".to_string();
        }
        self.0.iter().map(|s| s.name()).collect::<Vec<_>>().join(" + ")
    }
}

impl Strategy for Chain {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn apply(&self, hello: &mut ClientHello) {
        for step in &self.0 {
            step.apply(hello);
        }
    }
}

/// Remove SNI, then pad to hide the length change.
pub fn basic() -> Chain {
    Chain::new(vec![Box::new(RemoveSni), Box::new(FixedPadding(DEFAULT_PADDING))])
}

pub fn from_config(config: &ObfuscationConfig) -> Chain {
    let mut steps: Vec<Box<dyn Strategy>> = Vec::new();
    if config.remove_sni {
        steps.push(Box::new(RemoveSni));
    }
    match config.padding {
        PaddingConfig::None => {}
        PaddingConfig::Fixed { size } => steps.push(Box::new(FixedPadding(size))),
        PaddingConfig::Random { min, max } => steps.push(Box::new(RandomPadding { min, max })),
    }
    Chain::new(steps)
}
