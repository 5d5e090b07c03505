//! The trivial flow used by the cache-reuse seed scenario: always succeeds
//! immediately, does no subprocess work.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::flow::{Flow, FlowContext, FlowResults};
use crate::registry::FlowDescriptor;

pub struct EchoFlow {
    settings: Map<String, Value>,
}

#[async_trait]
impl Flow for EchoFlow {
    fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    async fn init(&mut self, _ctx: &mut FlowContext) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, _ctx: &mut FlowContext) -> Result<FlowResults> {
        Ok(FlowResults {
            success: true,
            runtime: 0.01,
            extra: Map::new(),
        })
    }
}

pub fn register(registry: &mut std::collections::HashMap<&'static str, FlowDescriptor>) {
    crate::registry::register(
        registry,
        "echo",
        FlowDescriptor {
            display_name: "Echo",
            summary: "Always succeeds without launching any tool.",
            constructor: Box::new(|settings| Ok(Box::new(EchoFlow { settings }))),
        },
    );
}
