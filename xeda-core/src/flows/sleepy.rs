//! A flow whose `run` sleeps past its own `timeout_seconds`, used to
//! exercise the process supervisor's timeout contract end-to-end without
//! depending on a real external tool.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::flow::{Flow, FlowContext, FlowResults};
use crate::registry::FlowDescriptor;

pub struct SleepyFlow {
    settings: Map<String, Value>,
}

impl SleepyFlow {
    fn timeout_seconds(&self) -> u64 {
        self.settings.get("timeout_seconds").and_then(Value::as_u64).unwrap_or(1)
    }
}

#[async_trait]
impl Flow for SleepyFlow {
    fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    async fn init(&mut self, _ctx: &mut FlowContext) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _ctx: &mut FlowContext) -> Result<FlowResults> {
        tokio::time::sleep(std::time::Duration::from_secs(self.timeout_seconds() + 5)).await;
        Ok(FlowResults {
            success: true,
            runtime: (self.timeout_seconds() + 5) as f64,
            extra: Map::new(),
        })
    }
}

pub fn register(registry: &mut std::collections::HashMap<&'static str, FlowDescriptor>) {
    crate::registry::register(
        registry,
        "sleepy",
        FlowDescriptor {
            display_name: "Sleepy",
            summary: "Sleeps past its own timeout; used to test timeout handling.",
            constructor: Box::new(|settings| Ok(Box::new(SleepyFlow { settings }))),
        },
    );
}
