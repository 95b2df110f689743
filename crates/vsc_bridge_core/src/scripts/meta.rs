use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::ScriptContext;
use crate::envelope::ScriptOutput;
use crate::error::ScriptError;
use crate::registry::{Script, ScriptKind};

pub struct ListScripts;

#[async_trait]
impl Script for ListScripts {
    fn name(&self) -> &'static str {
        "script.list"
    }

    fn kind(&self) -> ScriptKind {
        ScriptKind::Query
    }

    fn description(&self) -> &'static str {
        "List every registered script with its parameters"
    }

    async fn run(&self, ctx: ScriptContext, _params: Value) -> Result<ScriptOutput, ScriptError> {
        let scripts = ctx.registry.describe();
        let total = scripts.len();
        ScriptOutput::data(json!({ "scripts": scripts, "total": total }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capture::CaptureStore;
    use crate::debug::NoSessions;
    use crate::scripts::test_support::{context, run};

    #[tokio::test]
    async fn test_lists_every_builtin() {
        let ctx = context("/work", Arc::new(NoSessions), Arc::new(CaptureStore::new()));
        let envelope = run(&ctx, "script.list", json!({})).await;
        let data = envelope.data.expect("data");
        assert_eq!(data["total"], json!(ctx.registry.len()));

        let scripts = data["scripts"].as_array().expect("scripts");
        let wait = scripts
            .iter()
            .find(|s| s["name"] == json!("debug.wait-for-hit"))
            .expect("wait-for-hit listed");
        assert_eq!(wait["kind"], json!("waitable"));
        assert_eq!(wait["params"]["properties"]["timeoutMs"]["default"], json!(30000));
    }
}
