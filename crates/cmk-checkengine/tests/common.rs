//! Shared plugin fixtures for the integration tests.

#![allow(dead_code)]

use cmk_checkengine::{
    create_check_plugin, CheckPlugin, CheckPluginSpec, CheckResult, Metric, PluginFunction,
    Service, State,
};
use serde_json::{json, Value};

/// Section of the `cpu_load` plugin: load averages of a node.
pub fn load_section(load1: f64, load15: f64) -> Value {
    json!({"load1": load1, "load15": load15})
}

/// A plugin checking CPU load against `levels` from its parameters.
pub fn cpu_load_plugin() -> CheckPlugin {
    let discovery = PluginFunction::generator("discover_cpu_load", &["section"], |_| {
        vec![Service::new(None).into()]
    });
    let check = PluginFunction::generator("check_cpu_load", &["params", "section"], |args| {
        let section = args.section("cpu_load").cloned().unwrap_or(Value::Null);
        let load15 = section["load15"].as_f64().unwrap_or(0.0);
        let (warn, crit) = args
            .params
            .as_ref()
            .and_then(|p| p.get("levels"))
            .and_then(|l| Some((l[0].as_f64()?, l[1].as_f64()?)))
            .unwrap_or((5.0, 10.0));
        let state = if load15 >= crit {
            State::Crit
        } else if load15 >= warn {
            State::Warn
        } else {
            State::Ok
        };
        vec![
            CheckResult::new(state, format!("15 min load: {:.2}", load15))
                .unwrap()
                .into(),
            Metric::new("load15", load15)
                .unwrap()
                .with_levels(Some(warn), Some(crit))
                .into(),
        ]
    });
    let spec = CheckPluginSpec::new("cpu_load", "CPU load", discovery, check)
        .with_check_ruleset("cpu_load", json!({"levels": [5.0, 10.0]}))
        .with_module("cpu");
    create_check_plugin(spec, true).unwrap()
}
