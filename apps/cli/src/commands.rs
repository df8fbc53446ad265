//! CLI command implementations

use crate::output::{format_bytes, print_json, status_icon, truncate};
use crate::progress::DownloadProgress;
use crate::{ConfigAction, NotifyArg, OutputFormat};
use anyhow::{anyhow, Context, Result};
use console::style;
use dlq_core::{Connectivity, DlqCore};
use dlq_types::{
    CoreEvent, DirPayload, DownloadId, DownloadQuery, DownloadRecord, DownloadRequest, DownloadRow,
    DownloadStatus, NotificationVisibility, RequestPayload, Settings, StatusFilter,
};
use serde_json::Value;
use std::str::FromStr;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

// ============================================================================
// Download Commands
// ============================================================================

/// Arguments of `dlq add`
pub struct AddArgs {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub files_dir: Option<String>,
    pub public_dir: Option<String>,
    pub sub_path: Option<String>,
    pub dest: Option<String>,
    pub hidden: bool,
    pub notify: Option<NotifyArg>,
}

impl AddArgs {
    /// Build the same payload a bridge caller would send
    fn into_payload(self) -> Result<RequestPayload> {
        let sub_path = self.sub_path;
        let dir = |dir_type: String| DirPayload {
            dir_type: Some(dir_type),
            sub_path: sub_path.clone(),
        };

        Ok(RequestPayload {
            uri: Some(self.url),
            title: self.title,
            description: self.description,
            mime_type: self.mime_type,
            destination_in_external_files_dir: self.files_dir.map(dir),
            destination_in_external_public_dir: self.public_dir.map(dir),
            destination_uri: self.dest.as_deref().map(to_file_uri).transpose()?,
            visible_in_downloads_ui: Some(!self.hidden),
            notification_visibility: self.notify.map(|n| visibility(n).code()),
        })
    }
}

fn visibility(arg: NotifyArg) -> NotificationVisibility {
    match arg {
        NotifyArg::Visible => NotificationVisibility::Visible,
        NotifyArg::VisibleNotifyCompleted => NotificationVisibility::VisibleNotifyCompleted,
        NotifyArg::Hidden => NotificationVisibility::Hidden,
        NotifyArg::OnlyCompletion => NotificationVisibility::VisibleNotifyOnlyCompletion,
    }
}

/// Accept either a URI or a local path for `--dest`
fn to_file_uri(dest: &str) -> Result<String> {
    if let Ok(url) = Url::parse(dest) {
        // Single letters are Windows drive prefixes, not schemes
        if url.scheme().len() > 1 {
            return Ok(url.to_string());
        }
    }

    let path = std::env::current_dir()?.join(dest);
    Url::from_file_path(&path)
        .map(|url| url.to_string())
        .map_err(|_| anyhow!("Invalid destination path: {}", path.display()))
}

pub async fn add_download(core: &DlqCore, args: AddArgs, format: OutputFormat) -> Result<()> {
    let request = DownloadRequest::try_from(args.into_payload()?)?;
    let id = core.enqueue(request).await?;
    let record = core
        .engine()
        .store()
        .get(id)
        .ok_or_else(|| anyhow!("Download {} vanished after enqueue", id))?;

    match format {
        OutputFormat::Json => print_json(&record.to_row())?,
        OutputFormat::Human | OutputFormat::Table => {
            println!(
                "{} Enqueued download: {}",
                style("✓").green().bold(),
                style(record.title()).cyan()
            );
            println!("  ID: {}", id);
            println!("  URL: {}", record.request.uri);
            println!("  Run `dlq run` to start transfers");
        }
    }

    Ok(())
}

/// Parse `--status` values: names, or numeric bitmasks
fn parse_statuses(values: &[String]) -> Result<StatusFilter> {
    let mut statuses = Vec::new();

    for value in values.iter().flat_map(|v| v.split(',')) {
        let value = value.trim();
        if let Ok(mask) = value.parse::<i64>() {
            statuses.extend(StatusFilter::from_mask(mask).iter());
        } else {
            statuses.push(DownloadStatus::from_str(value)?);
        }
    }

    Ok(statuses.into_iter().collect())
}

fn parse_id(value: &str) -> Result<DownloadId> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid download id: {}", value))
}

pub fn list_downloads(
    core: &DlqCore,
    status_filter: Vec<String>,
    id_filter: Vec<String>,
    show_all: bool,
    format: OutputFormat,
) -> Result<()> {
    let statuses = if status_filter.is_empty() {
        core.settings().default_status_filter.clone()
    } else {
        parse_statuses(&status_filter)?
    };
    let ids = id_filter
        .iter()
        .map(|id| parse_id(id))
        .collect::<Result<Vec<_>>>()?;

    let records = core.query(&DownloadQuery { ids, statuses });

    match format {
        OutputFormat::Json => {
            let rows: Vec<DownloadRow> = records.iter().map(DownloadRow::from).collect();
            print_json(&rows)?;
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct ListRow {
                id: DownloadId,
                title: String,
                size: String,
                progress: String,
                status: DownloadStatus,
            }

            let rows: Vec<ListRow> = records
                .iter()
                .map(|r| ListRow {
                    id: r.id,
                    title: truncate(&r.title(), 30),
                    size: format_bytes(r.bytes_total),
                    progress: format!("{:.1}%", r.progress()),
                    status: r.status,
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if records.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for record in &records {
                print_download_summary(record, show_all);
            }
            println!();
            println!("{} download(s) total", style(records.len()).bold());
        }
    }

    Ok(())
}

fn print_download_summary(record: &DownloadRecord, detailed: bool) {
    let progress = format!("{:.1}%", record.progress());

    println!(
        "{} {} {} {} [{}]",
        status_icon(record.status),
        style(format!("#{}", record.id)).dim(),
        style(record.title()).bold(),
        style(&progress).dim(),
        style(record.status).dim()
    );

    if detailed {
        println!("    URL: {}", record.request.uri);
        if let Some(ref description) = record.request.description {
            println!("    Description: {}", description);
        }
        println!(
            "    Size: {} / {}",
            format_bytes(record.bytes_downloaded),
            format_bytes(record.bytes_total)
        );
        if let Some(ref media_type) = record.media_type {
            println!("    Type: {}", media_type);
        }
        if let Some(ref path) = record.local_path {
            println!("    File: {}", path.display());
        }
        if let Some(ref reason) = record.failure_reason {
            println!("    Error: {}", style(reason).red());
        }
        println!(
            "    Modified: {}",
            record.last_modified.format("%Y-%m-%d %H:%M:%S UTC")
        );
        println!();
    }
}

pub fn show_info(core: &DlqCore, id: &str, format: OutputFormat) -> Result<()> {
    let id = parse_id(id)?;
    let record = core
        .engine()
        .store()
        .get(id)
        .ok_or_else(|| anyhow!("Download not found: {}", id))?;

    match format {
        OutputFormat::Json => print_json(&record.to_row())?,
        _ => print_download_summary(&record, true),
    }

    Ok(())
}

pub async fn remove_downloads(
    core: &DlqCore,
    ids: Vec<String>,
    skip_confirm: bool,
    format: OutputFormat,
) -> Result<()> {
    let ids = ids.iter().map(|id| parse_id(id)).collect::<Result<Vec<_>>>()?;

    if !skip_confirm {
        use dialoguer::Confirm;

        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Remove {} download(s) and their files?",
                ids.len()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            return Ok(());
        }
    }

    let removed = core.remove(&ids).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "removed": removed }))?,
        _ => println!(
            "{} Removed {} download(s)",
            style("✓").green().bold(),
            removed
        ),
    }

    Ok(())
}

// ============================================================================
// Engine Commands
// ============================================================================

pub async fn run_engine(
    core: &DlqCore,
    until_idle: bool,
    offline: bool,
    format: OutputFormat,
) -> Result<()> {
    let engine = core.engine().clone();
    if offline {
        engine.set_connectivity(Connectivity::Offline);
    }

    let mut events = core.subscribe();
    let shutdown = CancellationToken::new();
    let runner = {
        let core = core.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { core.run(shutdown).await })
    };

    let mut progress = DownloadProgress::new();
    let human = matches!(format, OutputFormat::Human | OutputFormat::Table);
    if human {
        for record in core.query(&DownloadQuery::all().with_statuses(StatusFilter::active())) {
            progress.add_download(&record);
        }
    }

    let lookup = |id: DownloadId| engine.store().get(id);
    let show = |progress: &mut DownloadProgress, event: CoreEvent| -> Result<()> {
        if human {
            progress.handle_event(&event, lookup);
        } else {
            println!("{}", serde_json::to_string(&event)?);
        }
        Ok(())
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let idle = async {
        if until_idle {
            engine.wait_idle().await
        } else {
            std::future::pending().await
        }
    };
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, pausing transfers");
                break;
            }
            _ = &mut idle => break,
            event = events.recv() => match event {
                Ok(event) => show(&mut progress, event)?,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        }
    }

    shutdown.cancel();
    runner.await?;

    while let Ok(event) = events.try_recv() {
        show(&mut progress, event)?;
    }
    progress.clear();

    Ok(())
}

/// Raw bridge call; errors are printed as their JSON payload
pub async fn exec(core: &DlqCore, action: &str, args: &str) -> Result<()> {
    let args: Value =
        serde_json::from_str(args).context("Arguments must be a JSON array")?;

    match core.execute(action, args).await {
        Ok(result) => print_json(&result),
        Err(e) => {
            eprintln!("{}", serde_json::to_string_pretty(&e.to_payload())?);
            Err(e.into())
        }
    }
}

// ============================================================================
// Config Commands
// ============================================================================

/// JSON pointer for a dotted key such as `retry.max_attempts`
fn pointer(key: &str) -> String {
    format!("/{}", key.replace('.', "/"))
}

/// Flatten settings into `(dotted.key, value)` pairs
fn flatten(value: &Value, prefix: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(value, &key, out);
            }
        }
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
        other => out.push((prefix.to_string(), other.to_string())),
    }
}

/// Parse a value given on the command line for `key`
fn parse_config_value(key: &str, raw: &str) -> Result<Value> {
    if key == "default_status_filter" {
        let filter = parse_statuses(&[raw.to_string()])?;
        return Ok(serde_json::to_value(filter)?);
    }
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}

fn apply_config(settings: &Settings, key: &str, raw: &str) -> Result<Settings> {
    let mut value = serde_json::to_value(settings)?;
    let slot = value
        .pointer_mut(&pointer(key))
        .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
    *slot = parse_config_value(key, raw)?;

    let settings: Settings = serde_json::from_value(value)
        .with_context(|| format!("Invalid value for {}: {}", key, raw))?;
    settings.validate()?;
    Ok(settings)
}

pub async fn config_action(
    core: &DlqCore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = core.settings();

            match format {
                OutputFormat::Json => print_json(settings)?,
                OutputFormat::Table => {
                    let mut pairs = Vec::new();
                    flatten(&serde_json::to_value(settings)?, "", &mut pairs);
                    let mut builder = tabled::builder::Builder::default();
                    builder.set_header(["key", "value"]);
                    for (key, value) in pairs {
                        builder.push_record([key, value]);
                    }
                    println!("{}", builder.build());
                }
                OutputFormat::Human => {
                    println!("dlq Configuration ({}):", core.storage.settings_path().display());
                    println!();
                    let mut pairs = Vec::new();
                    flatten(&serde_json::to_value(settings)?, "", &mut pairs);
                    for (key, value) in pairs {
                        println!("  {}: {}", style(key).bold(), value);
                    }
                }
            }
        }

        Some(ConfigAction::Get { key }) => {
            let value = serde_json::to_value(core.settings())?;
            match value.pointer(&pointer(&key)) {
                Some(Value::String(s)) => println!("{}", s),
                Some(other) => println!("{}", other),
                None => return Err(anyhow!("Unknown config key: {}", key)),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let settings = apply_config(core.settings(), &key, &value)?;
            core.update_settings(&settings).await?;
            println!(
                "{} Config updated, takes effect on the next run",
                style("✓").green().bold()
            );
        }

        Some(ConfigAction::Reset { yes }) => {
            use dialoguer::Confirm;

            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                core.storage.reset_settings().await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}
