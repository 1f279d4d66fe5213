use crate::plugin::{Phase, PluginContext, PluginInstance, PluginResult};
use std::sync::Arc;

/// The plugin execution pipeline for a single route.
///
/// Built once per route and cached (see `ProxyWorker::get_or_build_pipeline`),
/// not once per request. Instances are sorted by priority once at build
/// time; `execute_phase` then just walks the slice and dispatches the
/// phase-specific method on each — no per-call HashMap lookups, no async.
pub struct PluginPipeline {
    instances: Vec<Arc<dyn PluginInstance>>,
    has_auth: bool,
}

impl PluginPipeline {
    /// Build a pipeline from already-configured instances.
    ///
    /// `has_auth` records whether any attached plugin is an authenticator
    /// (key-auth/jwt-auth/basic-auth) — the proxy uses this to decide
    /// whether a consumer-key lookup is needed after the Access phase.
    pub fn build(mut instances: Vec<Arc<dyn PluginInstance>>, has_auth: bool) -> Self {
        instances.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { instances, has_auth }
    }

    pub fn has_auth_plugins(&self) -> bool {
        self.has_auth
    }

    /// Run every instance's handler for `phase`, in priority order.
    /// Short-circuits on the first non-`Continue` result.
    pub fn execute_phase(&self, phase: Phase, ctx: &mut PluginContext) -> PluginResult {
        for instance in &self.instances {
            let result = match phase {
                Phase::Rewrite => instance.rewrite(ctx),
                Phase::Access => instance.access(ctx),
                Phase::BeforeProxy => instance.before_proxy(ctx),
                Phase::HeaderFilter => instance.header_filter(ctx),
                Phase::BodyFilter => instance.body_filter(ctx),
                Phase::Log => instance.log(ctx),
            };
            match result {
                PluginResult::Continue => {}
                response @ PluginResult::Response { .. } => return response,
            }
        }
        PluginResult::Continue
    }

    /// Run the log phase for every instance. Always best-effort — a
    /// logging plugin never aborts the response.
    pub fn execute_log_phase(&self, ctx: &mut PluginContext) {
        for instance in &self.instances {
            let _ = instance.log(ctx);
        }
    }

    /// Number of plugin instances attached to this pipeline.
    pub fn plugin_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Counter {
        name: &'static str,
        prio: i32,
        phase: Phase,
    }

    impl PluginInstance for Counter {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.prio
        }
        fn access(&self, ctx: &mut PluginContext) -> PluginResult {
            if self.phase == Phase::Access {
                ctx.vars.insert(self.name.to_string(), serde_json::Value::Bool(true));
            }
            PluginResult::Continue
        }
    }

    struct Blocker;
    impl PluginInstance for Blocker {
        fn name(&self) -> &str {
            "blocker"
        }
        fn priority(&self) -> i32 {
            9999
        }
        fn access(&self, _ctx: &mut PluginContext) -> PluginResult {
            PluginResult::Response { status: 403, headers: vec![], body: None }
        }
    }

    fn ctx() -> PluginContext {
        PluginContext::new("r1".into(), "1.2.3.4".into(), "GET".into(), "/".into(), HashMap::new())
    }

    #[test]
    fn empty_pipeline_continues() {
        let p = PluginPipeline::build(vec![], false);
        assert!(matches!(p.execute_phase(Phase::Access, &mut ctx()), PluginResult::Continue));
        assert_eq!(p.plugin_count(), 0);
    }

    #[test]
    fn runs_instances_in_priority_order() {
        let instances: Vec<Arc<dyn PluginInstance>> = vec![
            Arc::new(Counter { name: "low", prio: 1, phase: Phase::Access }),
            Arc::new(Counter { name: "high", prio: 100, phase: Phase::Access }),
        ];
        let p = PluginPipeline::build(instances, false);
        let mut c = ctx();
        p.execute_phase(Phase::Access, &mut c);
        assert!(c.vars.contains_key("low"));
        assert!(c.vars.contains_key("high"));
    }

    #[test]
    fn short_circuits_on_response() {
        let instances: Vec<Arc<dyn PluginInstance>> = vec![
            Arc::new(Blocker),
            Arc::new(Counter { name: "never", prio: 0, phase: Phase::Access }),
        ];
        let p = PluginPipeline::build(instances, false);
        let mut c = ctx();
        let result = p.execute_phase(Phase::Access, &mut c);
        assert!(matches!(result, PluginResult::Response { status: 403, .. }));
        assert!(!c.vars.contains_key("never"), "later plugin must not run after short-circuit");
    }

    #[test]
    fn unused_phase_is_a_noop() {
        let instances: Vec<Arc<dyn PluginInstance>> =
            vec![Arc::new(Counter { name: "a", prio: 0, phase: Phase::Access })];
        let p = PluginPipeline::build(instances, false);
        let mut c = ctx();
        assert!(matches!(p.execute_phase(Phase::HeaderFilter, &mut c), PluginResult::Continue));
    }

    #[test]
    fn has_auth_plugins_flag_is_passed_through() {
        let p = PluginPipeline::build(vec![], true);
        assert!(p.has_auth_plugins());
        let p2 = PluginPipeline::build(vec![], false);
        assert!(!p2.has_auth_plugins());
    }
}
