use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use censustab::{
    format_grouped, reorder_rows, BackoffPolicy, FailurePolicy, Pipeline, PipelineConfig,
    PipelineOutcome, PivotReport, Selection,
};

const DEFAULT_URL_TEMPLATE: &str = "https://api.insee.fr/donnees-locales/V0.1/donnees/geo-CS1_6-TACTR_2@GEO2023RP2020/COM-{entity}.all.all";
const DEFAULT_PRIMARY: &str = "CS1_6";
const DEFAULT_SECONDARY: &str = "TACTR_2";
const DEFAULT_MEASURES: &str = "POP";
const DEFAULT_FAILURE_POLICY: &str = "best-effort";
const DEFAULT_BACKOFF: &str = "fixed";
const DEFAULT_BACKOFF_MS: u64 = 1_000;
const DEFAULT_MAX_RETRIES: usize = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LOG_DIRECTIVE: &str = "warn";

#[tokio::main]
async fn main() -> Result<()> {
    init_cli_tracing();

    let args = CliArgs::from_env()?;
    let selection = Selection::new(args.entities.clone(), args.measures.clone())?;
    let pipeline = Pipeline::with_reqwest(args.to_pipeline_config()?)?;

    let outcome = pipeline
        .run_until_ctrl_c(&selection)
        .await
        .context("could not retrieve data")?;
    match outcome {
        PipelineOutcome::Tables(report) => print_report(&report),
        PipelineOutcome::NoData { skipped } => {
            println!("no data for this selection");
            for failure in skipped {
                println!("  skipped {}: {}", failure.entity, failure.reason);
            }
        }
    }

    Ok(())
}

fn init_cli_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    censustab::init_tracing();
}

fn print_report(report: &PivotReport) {
    for table in &report.tables {
        println!(
            "{} by {} x {}",
            table.measure(),
            table.primary_variable(),
            table.secondary_variable()
        );
        if table.is_empty() {
            println!("  (no cells)");
            continue;
        }

        let columns = table.columns();
        let header: Vec<&str> = columns
            .iter()
            .map(|code| table.secondary_label(code))
            .collect();
        println!("  {}", header.join(" | "));

        let mut rows = table.rows();
        reorder_rows(&mut rows);
        for row in rows {
            let values: Vec<String> = row
                .cells
                .iter()
                .map(|cell| format_grouped(cell.value))
                .collect();
            println!("  {}: {}", row.label, values.join(" | "));
        }
    }

    for failure in &report.skipped {
        println!("skipped {}: {}", failure.entity, failure.reason);
    }
}

struct CliArgs {
    url_template: String,
    token: String,
    entities: Vec<String>,
    measures: Vec<String>,
    primary: String,
    secondary: String,
    failure_policy: FailurePolicy,
    backoff: BackoffPolicy,
    max_retries: usize,
    request_timeout: Duration,
}

impl CliArgs {
    fn from_env() -> Result<Self> {
        let url_template = read_env_or_default("CENSUSTAB_URL_TEMPLATE", DEFAULT_URL_TEMPLATE);
        let token = env::var("CENSUSTAB_TOKEN").context("CENSUSTAB_TOKEN must be set")?;
        let entities = split_list(&env::var("CENSUSTAB_ENTITIES").unwrap_or_default());
        ensure!(
            !entities.is_empty(),
            "CENSUSTAB_ENTITIES must list at least one entity code"
        );
        let measures = split_list(&read_env_or_default("CENSUSTAB_MEASURES", DEFAULT_MEASURES));
        let primary = read_env_or_default("CENSUSTAB_PRIMARY", DEFAULT_PRIMARY);
        let secondary = read_env_or_default("CENSUSTAB_SECONDARY", DEFAULT_SECONDARY);

        let failure_policy =
            read_env_or_default("CENSUSTAB_FAILURE_POLICY", DEFAULT_FAILURE_POLICY)
                .parse::<FailurePolicy>()
                .context("failed to parse CENSUSTAB_FAILURE_POLICY")?;

        let backoff_ms = parse_env_with_default("CENSUSTAB_BACKOFF_MS", DEFAULT_BACKOFF_MS)?;
        ensure!(backoff_ms > 0, "CENSUSTAB_BACKOFF_MS must be greater than 0");
        let backoff_delay = Duration::from_millis(backoff_ms);
        let backoff = match read_env_or_default("CENSUSTAB_BACKOFF", DEFAULT_BACKOFF)
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "fixed" => BackoffPolicy::fixed(backoff_delay),
            "exponential" => BackoffPolicy::exponential(backoff_delay),
            other => bail!("unknown CENSUSTAB_BACKOFF {other:?}; expected fixed or exponential"),
        };

        let max_retries = parse_env_with_default("CENSUSTAB_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let timeout_secs = parse_env_with_default("CENSUSTAB_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;

        Ok(Self {
            url_template,
            token,
            entities,
            measures,
            primary,
            secondary,
            failure_policy,
            backoff,
            max_retries,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }

    fn to_pipeline_config(&self) -> Result<PipelineConfig> {
        PipelineConfig::builder()
            .url_template(self.url_template.clone())
            .auth_token(self.token.clone())
            .primary_variable(self.primary.clone())
            .secondary_variable(self.secondary.clone())
            .failure_policy(self.failure_policy)
            .backoff(self.backoff)
            .max_retries(self.max_retries)
            .request_timeout(self.request_timeout)
            .build()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

fn read_env_or_default(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default.to_string(),
    }
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("failed to parse {key}='{value}'")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}
