//! `constant` factory: capabilities that return a fixed JSON value.
//!
//! ```yaml
//! factory: constant
//! options:
//!   capabilities:
//!     - name: motd
//!       description: Message of the day
//!       value: "Welcome aboard"
//! ```

use serde::Deserialize;
use serde_json::Value;

use crate::plugins::catalog::{CapabilityFactory, FactoryContext};
use crate::plugins::errors::PluginError;
use crate::registry::{Capability, CapabilityMap, ParameterSpec};

#[derive(Debug, Deserialize)]
struct ConstantOptions {
    #[serde(default)]
    capabilities: Vec<ConstantSpec>,
}

#[derive(Debug, Deserialize)]
struct ConstantSpec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Vec<ParameterSpec>,
    #[serde(default)]
    value: Value,
}

pub struct ConstantFactory;

impl CapabilityFactory for ConstantFactory {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn build(&self, ctx: &FactoryContext<'_>) -> Result<CapabilityMap, PluginError> {
        let options: ConstantOptions = ctx.options()?;
        let mut map = CapabilityMap::new();
        for spec in options.capabilities {
            if spec.name.trim().is_empty() {
                return Err(ctx.error("capability name must not be empty"));
            }
            if map.contains_key(&spec.name) {
                return Err(ctx.error(format!("duplicate capability name '{}'", spec.name)));
            }
            let value = spec.value;
            let capability = Capability::new(ctx.kind, spec.name.clone(), spec.description, move |_| {
                let value = value.clone();
                async move { Ok(value) }
            })
            .with_parameters(spec.parameters);
            map.insert(spec.name, capability);
        }
        Ok(map)
    }
}
