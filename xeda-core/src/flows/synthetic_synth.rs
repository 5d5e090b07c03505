//! A closed-form stand-in for a real synthesis flow: `Fmax` is a simple
//! function of `clock_period`, so the DSE engine's bracket search can be
//! exercised without invoking an actual synthesizer.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::error::Result;
use crate::flow::{Flow, FlowContext, FlowResults};
use crate::registry::FlowDescriptor;

pub struct SyntheticSynthFlow {
    settings: Map<String, Value>,
}

impl SyntheticSynthFlow {
    fn clock_period(&self) -> f64 {
        self.settings.get("clock_period").and_then(Value::as_f64).unwrap_or(10.0)
    }

    /// Peaks at `clock_period == 5.0`, where `Fmax == 200`.
    fn fmax(&self) -> f64 {
        200.0 - (self.clock_period() - 5.0).abs() * 10.0
    }
}

#[async_trait]
impl Flow for SyntheticSynthFlow {
    fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    async fn init(&mut self, _ctx: &mut FlowContext) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _ctx: &mut FlowContext) -> Result<FlowResults> {
        let fmax = self.fmax();
        let mut extra = Map::new();
        extra.insert("Fmax".to_string(), json!(fmax));
        Ok(FlowResults {
            success: fmax <= 200.0,
            runtime: 0.01,
            extra,
        })
    }
}

pub fn register(registry: &mut std::collections::HashMap<&'static str, FlowDescriptor>) {
    crate::registry::register(
        registry,
        "synthetic_synth",
        FlowDescriptor {
            display_name: "Synthetic Synth",
            summary: "Closed-form Fmax(clock_period), used to exercise the DSE optimizer.",
            constructor: Box::new(|settings| Ok(Box::new(SyntheticSynthFlow { settings }))),
        },
    );
}
