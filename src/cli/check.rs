use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::path::Path;

use crate::core::models::CostAndUsageRequest;
use crate::core::query::QueryDescriptor;
use crate::core::settings::{FailurePolicy, Settings};
use crate::sources::{Source, SourceRegistry};

#[derive(Serialize)]
struct CheckOutput {
    slots: Vec<SlotStatus>,
    failure_policy: FailurePolicy,
    retry_delay_secs: u64,
    max_retries: u32,
    cooldown_secs: u64,
    metrics_url: String,
    probes: ProbeEndpoints,
}

#[derive(Serialize)]
struct SlotStatus {
    slot: String,
    client: String,
    refresh_interval_secs: u64,
    query: QueryDescriptor,
    next_request: CostAndUsageRequest,
}

#[derive(Serialize)]
struct ProbeEndpoints {
    liveness: String,
    readiness: String,
    startup: String,
}

/// Loads and validates the config, then prints the resolved schedule.
pub fn run(config: Option<&Path>, json: bool) -> Result<()> {
    let settings = Settings::load(config)?;
    let sources = SourceRegistry::builtin().resolve(&settings)?;
    let output = build_output(&settings, &sources);

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_text_output(&output);
    }

    Ok(())
}

fn build_output(settings: &Settings, sources: &[Source]) -> CheckOutput {
    let now = Utc::now();
    let slots = sources
        .iter()
        .flat_map(|source| {
            source.queries.iter().map(move |(id, descriptor)| SlotStatus {
                slot: id.to_string(),
                client: source.name.clone(),
                refresh_interval_secs: descriptor.granularity().refresh_interval().as_secs(),
                query: descriptor.as_ref().clone(),
                next_request: descriptor.build_request(now),
            })
        })
        .collect();

    let probe_url = |path: &str| {
        format!(
            "http://{}:{}{}",
            settings.probes.host, settings.probes.port, path
        )
    };

    CheckOutput {
        slots,
        failure_policy: settings.scheduler.failure_policy,
        retry_delay_secs: settings.scheduler.retry_delay_secs,
        max_retries: settings.scheduler.max_retries,
        cooldown_secs: settings.converter.cooldown_secs,
        metrics_url: format!(
            "http://{}:{}{}",
            settings.output.host, settings.output.port, settings.output.path
        ),
        probes: ProbeEndpoints {
            liveness: probe_url(&settings.probes.liveness),
            readiness: probe_url(&settings.probes.readiness),
            startup: probe_url(&settings.probes.startup),
        },
    }
}

fn print_text_output(output: &CheckOutput) {
    println!("Configuration OK: {} slot(s)", output.slots.len());
    println!();

    for slot in &output.slots {
        let window = &slot.next_request.time_period;
        println!("{} ({})", slot.slot, slot.client);
        println!("  {:<12} {}", "Granularity:", slot.query.granularity());
        println!("  {:<12} {}", "Measures:", slot.query.measures().join(", "));
        if !slot.query.group_by().is_empty() {
            let groups: Vec<String> = slot.query.group_by().iter().map(|g| g.to_string()).collect();
            println!("  {:<12} {}", "Group by:", groups.join(", "));
        }
        println!(
            "  {:<12} {}",
            "Filter:",
            if slot.query.filter().is_some() { "yes" } else { "none" }
        );
        println!("  {:<12} {} .. {}", "Window:", window.start, window.end);
        println!(
            "  {:<12} every {}h",
            "Refresh:",
            slot.refresh_interval_secs / 3600
        );
    }

    println!();
    println!(
        "Retries: {} every {}s, then {:?}",
        output.max_retries, output.retry_delay_secs, output.failure_policy
    );
    println!("Conversion cooldown: {}s", output.cooldown_secs);
    println!("Metrics: {}", output.metrics_url);
    println!(
        "Probes: {}, {}, {}",
        output.probes.liveness, output.probes.readiness, output.probes.startup
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_output() {
        let settings = Settings::from_toml(
            r#"
            [[clients.aws.metrics]]
            granularity = "hourly"
            metrics = ["UsageQuantity"]
            group_by = [{ type = "dimension", key = "SERVICE" }]

            [[clients.aws.metrics]]
            granularity = "monthly"
            metrics = ["NetAmortizedCost"]
            "#,
        )
        .unwrap();
        let sources = SourceRegistry::builtin().resolve(&settings).unwrap();

        let output = build_output(&settings, &sources);

        assert_eq!(output.slots.len(), 2);
        assert_eq!(output.slots[0].slot, "aws_0");
        assert_eq!(output.slots[0].refresh_interval_secs, 3600);
        assert_eq!(output.slots[0].query.group_by()[0].group_type, "DIMENSION");
        assert_eq!(output.slots[1].refresh_interval_secs, 86400);
        assert_eq!(output.metrics_url, "http://0.0.0.0:8080/metrics");
        assert_eq!(output.probes.readiness, "http://0.0.0.0:8989/ready");

        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["failure_policy"], "isolate");
        assert_eq!(json["slots"][1]["next_request"]["Granularity"], "MONTHLY");
    }
}
