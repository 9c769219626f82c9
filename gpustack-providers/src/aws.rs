//! AWS adapter driving the `aws` CLI.
//!
//! Output is parsed into typed structs. Price and image lookups fail closed:
//! output that does not parse yields an empty result and a warning.
use crate::inventory::{InstanceDescription, InstanceSpec, InstanceState, PriceSample};
use crate::{CloudProvider, TransientError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpustack_common::{Architecture, Market};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const TRANSIENT_MARKERS: [&str; 8] = [
    "Throttling",
    "RequestLimitExceeded",
    "RequestTimeout",
    "ServiceUnavailable",
    "InternalError",
    "Could not connect to the endpoint",
    "Read timeout",
    "Connect timeout",
];

// Service Quotas codes for "Running On-Demand G and VT instances" / "All G and VT Spot Instance Requests"
const QUOTA_ON_DEMAND_G: &str = "L-DB2E81BA";
const QUOTA_SPOT_G: &str = "L-3819A6DF";

// Spot request status codes announcing an imminent reclaim.
const RECLAIM_STATUS_CODES: [&str; 3] = [
    "marked-for-termination",
    "marked-for-stop",
    "marked-for-hibernation",
];

pub struct AwsCliProvider {
    binary: String,
    profile: Option<String>,
    call_timeout: Duration,
    /// AMI name filter per architecture.
    image_name_patterns: BTreeMap<Architecture, String>,
    image_owners: Vec<String>,
    /// Reference on-demand prices; types missing here are not offered on-demand.
    on_demand_prices: BTreeMap<String, f64>,
    bootstrap_poll_interval: Duration,
    bootstrap_timeout: Duration,
}

impl AwsCliProvider {
    pub fn new(profile: Option<String>, on_demand_prices: BTreeMap<String, f64>) -> Self {
        let mut image_name_patterns = BTreeMap::new();
        image_name_patterns.insert(
            Architecture::X86_64,
            "Deep Learning Base OSS Nvidia Driver GPU AMI (Ubuntu 22.04)*".to_string(),
        );
        image_name_patterns.insert(
            Architecture::Arm64,
            "Deep Learning ARM64 Base OSS Nvidia Driver GPU AMI (Ubuntu 22.04)*".to_string(),
        );
        let profile = profile
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Self {
            binary: "aws".to_string(),
            profile,
            call_timeout: Duration::from_secs(60),
            image_name_patterns,
            image_owners: vec!["amazon".to_string()],
            on_demand_prices,
            bootstrap_poll_interval: Duration::from_secs(5),
            bootstrap_timeout: Duration::from_secs(600),
        }
    }

    async fn run(&self, region: &str, args: &[String]) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .arg("--region")
            .arg(region)
            .arg("--output")
            .arg("json");
        if let Some(profile) = &self.profile {
            cmd.arg("--profile").arg(profile);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let label = args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {} {}", self.binary, label))?;
        let output = match tokio::time::timeout(self.call_timeout, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(TransientError(format!(
                    "aws {} timed out after {}s",
                    label,
                    self.call_timeout.as_secs()
                ))
                .into())
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(&label, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn spot_request_notice(&self, region: &str, request_id: &str) -> Option<DateTime<Utc>> {
        let args = strings(&[
            "ec2",
            "describe-spot-instance-requests",
            "--spot-instance-request-ids",
            request_id,
        ]);
        let raw = match self.run(region, &args).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("⚠️ [aws] spot request {} lookup failed: {:#}", request_id, e);
                return None;
            }
        };
        match serde_json::from_str::<SpotRequestsOutput>(&raw) {
            Ok(out) => reclaim_notice(&out),
            Err(e) => {
                tracing::warn!("⚠️ [aws] unparseable spot request output: {}", e);
                None
            }
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn classify_failure(label: &str, stderr: &str) -> anyhow::Error {
    let msg = format!("aws {} failed: {}", label, stderr);
    if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        TransientError(msg).into()
    } else {
        anyhow::anyhow!(msg)
    }
}

/// SSM answers `InvalidInstanceId` until the agent on a fresh instance has
/// registered. EC2's `InvalidInstanceID.NotFound` is a different, final error.
fn is_agent_not_ready(err: &anyhow::Error) -> bool {
    let text = format!("{:#}", err);
    text.contains("(InvalidInstanceId)") || text.contains("not in a valid state for account")
}

fn is_not_found(err: &anyhow::Error) -> bool {
    let text = format!("{:#}", err);
    text.contains("InvalidInstanceID.NotFound") || text.contains("InvalidInstanceID.Malformed")
}

// --- CLI output shapes ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotPriceHistoryOutput {
    #[serde(default)]
    spot_price_history: Vec<SpotPriceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotPriceEntry {
    availability_zone: String,
    instance_type: String,
    spot_price: String,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OfferingsOutput {
    #[serde(default)]
    instance_type_offerings: Vec<Offering>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Offering {
    instance_type: String,
    location: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImagesOutput {
    #[serde(default)]
    images: Vec<ImageEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageEntry {
    image_id: String,
    #[serde(default)]
    creation_date: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    instances: Vec<InstanceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<InstanceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceEntry {
    instance_id: String,
    #[serde(default)]
    state: Option<InstanceStateEntry>,
    #[serde(default)]
    public_ip_address: Option<String>,
    #[serde(default)]
    spot_instance_request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceStateEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotRequestsOutput {
    #[serde(default)]
    spot_instance_requests: Vec<SpotRequestEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotRequestEntry {
    status: SpotRequestStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotRequestStatus {
    code: String,
    #[serde(default)]
    update_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendCommandOutput {
    command: SentCommand,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SentCommand {
    command_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvocationOutput {
    status: String,
    #[serde(default)]
    standard_error_content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QuotaOutput {
    quota: QuotaEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QuotaEntry {
    value: f64,
}

// --- Parsing helpers ---

fn parse_spot_history(raw: &str) -> Result<Vec<PriceSample>> {
    let out: SpotPriceHistoryOutput = serde_json::from_str(raw)?;
    Ok(out
        .spot_price_history
        .into_iter()
        .filter_map(|e| {
            let price = e.spot_price.trim().parse::<f64>().ok()?;
            Some(PriceSample {
                instance_type: e.instance_type,
                availability_zone: e.availability_zone,
                hourly_price: price,
                market: Market::Spot,
                sampled_at: e.timestamp,
            })
        })
        .collect())
}

fn parse_offerings(raw: &str, prices: &BTreeMap<String, f64>, now: DateTime<Utc>) -> Result<Vec<PriceSample>> {
    let out: OfferingsOutput = serde_json::from_str(raw)?;
    Ok(out
        .instance_type_offerings
        .into_iter()
        .filter_map(|o| {
            let price = *prices.get(&o.instance_type)?;
            Some(PriceSample {
                instance_type: o.instance_type,
                availability_zone: o.location,
                hourly_price: price,
                market: Market::OnDemand,
                sampled_at: now,
            })
        })
        .collect())
}

/// Newest image by creation date.
fn newest_image(raw: &str) -> Result<Option<String>> {
    let out: ImagesOutput = serde_json::from_str(raw)?;
    // ISO-8601 dates sort lexicographically
    Ok(out
        .images
        .into_iter()
        .max_by(|a, b| a.creation_date.cmp(&b.creation_date))
        .map(|i| i.image_id))
}

fn instances_of(out: DescribeInstancesOutput) -> Vec<InstanceEntry> {
    out.reservations.into_iter().flat_map(|r| r.instances).collect()
}

fn state_of(entry: &InstanceEntry) -> InstanceState {
    entry
        .state
        .as_ref()
        .map(|s| InstanceState::parse(&s.name))
        .unwrap_or(InstanceState::Unknown)
}

fn reclaim_notice(out: &SpotRequestsOutput) -> Option<DateTime<Utc>> {
    out.spot_instance_requests
        .iter()
        .find(|r| RECLAIM_STATUS_CODES.contains(&r.status.code.as_str()))
        .map(|r| r.status.update_time.unwrap_or_else(Utc::now))
}

/// Four decimals, truncated so the bid never exceeds the ceiling.
fn format_bid(max_price: f64) -> String {
    // nudge before flooring so float noise like 0.7499999.. stays 0.7500
    let mut ten_thousandths = (max_price * 10_000.0 + 1e-6).floor();
    if ten_thousandths / 10_000.0 > max_price {
        ten_thousandths -= 1.0;
    }
    format!("{:.4}", ten_thousandths / 10_000.0)
}

fn run_instances_args(spec: &InstanceSpec) -> Result<Vec<String>> {
    let mut args = strings(&[
        "ec2",
        "run-instances",
        "--image-id",
        &spec.image_id,
        "--instance-type",
        &spec.instance_type,
        "--count",
        "1",
        "--client-token",
        &spec.client_token,
        "--placement",
    ]);
    args.push(format!("AvailabilityZone={}", spec.availability_zone));
    if let Some(subnet) = &spec.infra.subnet_id {
        args.push("--subnet-id".into());
        args.push(subnet.clone());
    }
    if !spec.infra.security_group_ids.is_empty() {
        args.push("--security-group-ids".into());
        args.extend(spec.infra.security_group_ids.iter().cloned());
    }
    if let Some(key) = &spec.infra.key_name {
        args.push("--key-name".into());
        args.push(key.clone());
    }
    if let Some(profile) = &spec.infra.instance_profile {
        args.push("--iam-instance-profile".into());
        args.push(format!("Name={}", profile));
    }
    if spec.market == Market::Spot {
        let mut spot = serde_json::json!({
            "SpotInstanceType": "one-time",
            "InstanceInterruptionBehavior": "terminate",
        });
        if let Some(max) = spec.max_price {
            spot["MaxPrice"] = serde_json::json!(format_bid(max));
        }
        args.push("--instance-market-options".into());
        args.push(serde_json::to_string(&serde_json::json!({
            "MarketType": "spot",
            "SpotOptions": spot,
        }))?);
    }
    args.push("--block-device-mappings".into());
    args.push(serde_json::to_string(&serde_json::json!([{
        "DeviceName": "/dev/sda1",
        "Ebs": { "VolumeSize": spec.root_volume_gb, "VolumeType": "gp3", "DeleteOnTermination": true }
    }]))?);
    args.push("--tag-specifications".into());
    args.push(serde_json::to_string(&serde_json::json!([{
        "ResourceType": "instance",
        "Tags": [
            { "Key": "Name", "Value": format!("gpustack-{}", spec.stack_name) },
            { "Key": "gpustack:stack", "Value": spec.stack_name },
            { "Key": "gpustack:architecture", "Value": spec.architecture.as_str() },
        ]
    }]))?);
    Ok(args)
}

#[async_trait]
impl CloudProvider for AwsCliProvider {
    async fn list_prices(
        &self,
        instance_types: &[String],
        region: &str,
        market: Market,
    ) -> Result<Vec<PriceSample>> {
        if instance_types.is_empty() {
            return Ok(Vec::new());
        }
        match market {
            Market::Spot => {
                let mut args = strings(&["ec2", "describe-spot-price-history", "--instance-types"]);
                args.extend(instance_types.iter().cloned());
                args.extend(strings(&["--product-descriptions", "Linux/UNIX", "--start-time"]));
                args.push(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
                let raw = self.run(region, &args).await?;
                match parse_spot_history(&raw) {
                    Ok(samples) => Ok(samples),
                    Err(e) => {
                        tracing::warn!("⚠️ [aws] unparseable spot price output for {}: {}", region, e);
                        Ok(Vec::new())
                    }
                }
            }
            Market::OnDemand => {
                let mut args = strings(&[
                    "ec2",
                    "describe-instance-type-offerings",
                    "--location-type",
                    "availability-zone",
                    "--filters",
                ]);
                args.push(format!("Name=instance-type,Values={}", instance_types.join(",")));
                let raw = self.run(region, &args).await?;
                match parse_offerings(&raw, &self.on_demand_prices, Utc::now()) {
                    Ok(samples) => Ok(samples),
                    Err(e) => {
                        tracing::warn!("⚠️ [aws] unparseable offerings output for {}: {}", region, e);
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    async fn resolve_image(&self, region: &str, architecture: Architecture) -> Result<Option<String>> {
        let Some(pattern) = self.image_name_patterns.get(&architecture) else {
            return Ok(None);
        };
        let mut args = strings(&["ec2", "describe-images", "--owners"]);
        args.extend(self.image_owners.iter().cloned());
        args.push("--filters".into());
        args.push(format!("Name=name,Values={}", pattern));
        args.push(format!("Name=architecture,Values={}", architecture.as_str()));
        args.push("Name=state,Values=available".into());
        let raw = self.run(region, &args).await?;
        match newest_image(&raw) {
            Ok(id) => Ok(id),
            Err(e) => {
                tracing::warn!("⚠️ [aws] unparseable image output for {}: {}", region, e);
                Ok(None)
            }
        }
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        let args = run_instances_args(spec)?;
        let raw = self.run(&spec.region, &args).await?;
        let out: RunInstancesOutput =
            serde_json::from_str(&raw).context("unparseable run-instances output")?;
        out.instances
            .into_iter()
            .next()
            .map(|i| i.instance_id)
            .context("run-instances returned no instance")
    }

    async fn find_by_client_token(&self, region: &str, client_token: &str) -> Result<Option<String>> {
        let mut args = strings(&["ec2", "describe-instances", "--filters"]);
        args.push(format!("Name=client-token,Values={}", client_token));
        let raw = self.run(region, &args).await?;
        let out: DescribeInstancesOutput =
            serde_json::from_str(&raw).context("unparseable describe-instances output")?;
        let instances = instances_of(out);
        let live = instances.iter().find(|i| !state_of(i).is_gone());
        Ok(live
            .or_else(|| instances.first())
            .map(|i| i.instance_id.clone()))
    }

    async fn describe_instance(&self, region: &str, resource_id: &str) -> Result<InstanceDescription> {
        let args = strings(&["ec2", "describe-instances", "--instance-ids", resource_id]);
        let raw = match self.run(region, &args).await {
            Ok(raw) => raw,
            Err(e) if is_not_found(&e) => {
                return Ok(InstanceDescription {
                    state: InstanceState::Terminated,
                    reclaim_notice: None,
                    public_address: None,
                })
            }
            Err(e) => return Err(e),
        };
        let out: DescribeInstancesOutput =
            serde_json::from_str(&raw).context("unparseable describe-instances output")?;
        let entry = instances_of(out)
            .into_iter()
            .find(|i| i.instance_id == resource_id)
            .with_context(|| format!("{} missing from describe-instances", resource_id))?;
        let state = state_of(&entry);
        let reclaim_notice = match (&entry.spot_instance_request_id, state) {
            (Some(request_id), InstanceState::Running) => {
                self.spot_request_notice(region, request_id).await
            }
            _ => None,
        };
        Ok(InstanceDescription {
            state,
            reclaim_notice,
            public_address: entry.public_ip_address,
        })
    }

    async fn terminate_instance(&self, region: &str, resource_id: &str) -> Result<()> {
        let args = strings(&["ec2", "terminate-instances", "--instance-ids", resource_id]);
        match self.run(region, &args).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                tracing::info!("[aws] {} already gone", resource_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn push_bootstrap(&self, region: &str, resource_id: &str, script: &str) -> Result<()> {
        let commands: Vec<&str> = script.lines().collect();
        let mut args = strings(&[
            "ssm",
            "send-command",
            "--document-name",
            "AWS-RunShellScript",
            "--instance-ids",
            resource_id,
            "--comment",
            "gpustack bootstrap",
            "--parameters",
        ]);
        args.push(serde_json::to_string(&serde_json::json!({ "commands": commands }))?);

        let started = tokio::time::Instant::now();
        let mut attempt: u32 = 0;
        let raw = loop {
            attempt += 1;
            match self.run(region, &args).await {
                Ok(raw) => break raw,
                Err(e) if is_agent_not_ready(&e) || crate::is_transient(&e) => {
                    let delay = (self.bootstrap_poll_interval * attempt).min(Duration::from_secs(30));
                    if started.elapsed() + delay > self.bootstrap_timeout {
                        return Err(e.context(format!(
                            "ssm agent on {} not reachable within {}s",
                            resource_id,
                            self.bootstrap_timeout.as_secs()
                        )));
                    }
                    println!(
                        "⏳ [aws] ssm not ready on {} (attempt {}), retrying in {}s",
                        resource_id,
                        attempt,
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };
        let sent: SendCommandOutput =
            serde_json::from_str(&raw).context("unparseable send-command output")?;
        let command_id = sent.command.command_id;

        let mut ticker = tokio::time::interval(self.bootstrap_poll_interval);
        loop {
            ticker.tick().await;
            if started.elapsed() > self.bootstrap_timeout {
                anyhow::bail!(
                    "bootstrap command {} on {} did not finish within {}s",
                    command_id,
                    resource_id,
                    self.bootstrap_timeout.as_secs()
                );
            }
            let args = strings(&[
                "ssm",
                "get-command-invocation",
                "--command-id",
                &command_id,
                "--instance-id",
                resource_id,
            ]);
            let raw = match self.run(region, &args).await {
                Ok(raw) => raw,
                // the invocation is not registered for a moment after send-command
                Err(e) if format!("{:#}", e).contains("InvocationDoesNotExist") => continue,
                Err(e) if crate::is_transient(&e) => {
                    tracing::warn!("⚠️ [aws] bootstrap poll: {:#}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let inv: InvocationOutput =
                serde_json::from_str(&raw).context("unparseable get-command-invocation output")?;
            match inv.status.as_str() {
                "Success" => return Ok(()),
                "Pending" | "InProgress" | "Delayed" => continue,
                other => anyhow::bail!(
                    "bootstrap command {} ended {}: {}",
                    command_id,
                    other,
                    crate::ssh::tail_str(&inv.standard_error_content, 2000)
                ),
            }
        }
    }

    async fn vcpu_quota(&self, region: &str, market: Market) -> Result<Option<f64>> {
        let code = match market {
            Market::Spot => QUOTA_SPOT_G,
            Market::OnDemand => QUOTA_ON_DEMAND_G,
        };
        let args = strings(&[
            "service-quotas",
            "get-service-quota",
            "--service-code",
            "ec2",
            "--quota-code",
            code,
        ]);
        let raw = self.run(region, &args).await?;
        let out: QuotaOutput = serde_json::from_str(&raw).context("unparseable quota output")?;
        Ok(Some(out.quota.value))
    }
}
