//! Place-and-route stand-in that depends on [`super::yosys_synth`]; the
//! dependency-chain seed scenario is built around this pair.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::flow::{Artifact, Dependency, Flow, FlowContext, FlowResults};
use crate::registry::FlowDescriptor;

pub struct OpenroadFlow {
    settings: Map<String, Value>,
}

#[async_trait]
impl Flow for OpenroadFlow {
    fn settings(&self) -> &Map<String, Value> {
        &self.settings
    }

    async fn init(&mut self, ctx: &mut FlowContext) -> Result<()> {
        ctx.add_dependency(Dependency::new("yosys_synth"));
        Ok(())
    }

    async fn run(&mut self, ctx: &mut FlowContext) -> Result<FlowResults> {
        let netlist_source = ctx
            .completed_dependencies
            .iter()
            .find(|d| d.flow_name == "yosys_synth")
            .and_then(|d| d.artifacts.get("netlist_verilog"))
            .and_then(|artifact| match artifact {
                Artifact::One(path) => Some(path.clone()),
                Artifact::Many(paths) => paths.first().cloned(),
            });

        let netlist_available = match netlist_source {
            Some(source) => {
                let dest = ctx.run_path.join(source.file_name().unwrap_or_else(|| source.as_os_str()));
                std::fs::copy(&source, &dest)?;
                ctx.artifacts.insert("netlist_verilog".to_string(), Artifact::One(dest));
                true
            }
            None => false,
        };
        Ok(FlowResults {
            success: netlist_available,
            runtime: 0.02,
            extra: Map::new(),
        })
    }
}

pub fn register(registry: &mut std::collections::HashMap<&'static str, FlowDescriptor>) {
    crate::registry::register(
        registry,
        "openroad",
        FlowDescriptor {
            display_name: "OpenROAD",
            summary: "Place-and-route; depends on yosys_synth for its input netlist.",
            constructor: Box::new(|settings| Ok(Box::new(OpenroadFlow { settings }))),
        },
    );
}
