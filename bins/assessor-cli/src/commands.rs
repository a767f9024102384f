// CLI commands for authoring and checking assessment catalogs
use anyhow::{bail, Context, Result};
use assessor_common::config::DispatchSettings;
use assessor_common::results::Verdict;
use assessor_engine::catalog::{Catalog, CatalogDocument, CatalogSnapshot};
use assessor_engine::dispatcher::Dispatcher;
use assessor_engine::harness::{check_rows, AdminHarness, DryRunReport, ImportError};
use assessor_engine::languages::LanguageRegistry;
use assessor_engine::sandbox::{CodeSandbox, DockerSandbox, UnavailableSandbox};
use assessor_engine::submission::Submission;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

const SAMPLE_CATALOG: &str = include_str!("../../../config/catalog.sample.json");

fn read_document(path: &Path) -> Result<CatalogDocument> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse catalog: {}", path.display()))
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    Catalog::from_document(read_document(path)?)
        .with_context(|| format!("Catalog is invalid: {}", path.display()))
}

fn write_document(path: &Path, document: &CatalogDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(document)?;
    fs::write(path, json).with_context(|| format!("Failed to write catalog: {}", path.display()))
}

/// Initialize a project with a language registry and a sample catalog
pub fn init_project(path: &str) -> Result<()> {
    println!("🚀 Initializing assessor project at: {}", path);

    let config_dir = Path::new(path).join("config");
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create directory: {}", config_dir.display()))?;
    println!("  ✅ Created: config");

    let languages_path = config_dir.join("languages.json");
    if languages_path.exists() {
        println!("  ⏭️  Kept existing: config/languages.json");
    } else {
        let json = LanguageRegistry::builtin().to_json()?;
        fs::write(&languages_path, json)?;
        println!("  ✅ Created: config/languages.json");
    }

    let catalog_path = config_dir.join("catalog.json");
    if catalog_path.exists() {
        println!("  ⏭️  Kept existing: config/catalog.json");
    } else {
        fs::write(&catalog_path, SAMPLE_CATALOG)?;
        println!("  ✅ Created: config/catalog.json");
    }

    println!("✅ Project initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Check the catalog: assessor-cli validate --catalog config/catalog.json");
    println!("  2. Start the API with CATALOG_PATH=config/catalog.json");
    println!("  3. Set REDIS_URL to keep candidate progress across restarts");

    Ok(())
}

/// Print every structural problem in a catalog file; fails if there are any
pub fn validate_catalog(path: &Path) -> Result<()> {
    let document = read_document(path)?;
    let (snapshot, issues) = CatalogSnapshot::from_document(document);

    println!("🔍 Validating {}", path.display());
    println!(
        "  {} exercises, {} challenges, {} steps, {} test cases",
        snapshot.exercises.len(),
        snapshot.challenges.len(),
        snapshot.steps.len(),
        snapshot.testcases.len()
    );

    if issues.is_empty() {
        println!("✅ Catalog is valid");
        return Ok(());
    }
    for issue in &issues {
        println!("  ❌ {}", issue);
    }
    bail!("{} problem(s) found in {}", issues.len(), path.display())
}

/// Evaluate a local file against one step, the way the admin dry-run endpoint does
pub async fn dry_run(
    catalog_path: &Path,
    step_id: Uuid,
    file: &Path,
    language: Option<&str>,
    languages_config: &Path,
) -> Result<()> {
    let catalog = Arc::new(load_catalog(catalog_path)?);
    let languages = Arc::new(
        LanguageRegistry::load_or_builtin(languages_config).context("Failed to load language registry")?,
    );
    let source = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let sandbox: Arc<dyn CodeSandbox> = match DockerSandbox::connect(languages.clone()).await {
        Ok(docker) => Arc::new(docker),
        Err(e) => {
            warn!(error = %e, "Docker unavailable; only non-code steps can be evaluated");
            Arc::new(UnavailableSandbox::new(e.to_string()))
        }
    };
    let dispatcher = Arc::new(Dispatcher::new(sandbox, DispatchSettings::default()));
    let harness = AdminHarness::new(catalog, dispatcher, languages);

    let submission = Submission {
        code: Some(source.clone()),
        content: Some(source),
        language: language.map(str::to_string),
    };

    println!("🧪 Dry-running {} against step {}", file.display(), step_id);
    let report = harness.dry_run(step_id, &submission).await?;
    print_report(&report);

    if !report.summary.all_passed {
        bail!(
            "{} of {} test cases did not pass",
            report.summary.total - report.summary.passed,
            report.summary.total
        );
    }
    Ok(())
}

fn print_report(report: &DryRunReport) {
    for result in &report.execution_results {
        let icon = match result.verdict {
            Verdict::Passed => "✅",
            Verdict::Failed => "❌",
            Verdict::ReviewPending => "⏳",
        };
        let hidden = if result.is_hidden { " (hidden)" } else { "" };
        let time = result
            .metrics
            .execution_time_ms
            .map(|ms| format!(" {}ms", ms))
            .unwrap_or_default();
        println!("  {} {}{}{}", icon, result.name, hidden, time);
        if let Some(message) = &result.message {
            println!("      {}", message);
        }
    }
    println!(
        "\n📊 {}/{} passed ({}%), score {:.1}, {} pending review, {}ms",
        report.summary.passed,
        report.summary.total,
        report.summary.success_rate,
        report.score,
        report.summary.pending_review,
        report.elapsed_ms
    );
}

/// Check import rows against a step and optionally write them into the catalog.
/// Returns how many rows were accepted.
pub fn import_rows(catalog_path: &Path, step_id: Uuid, rows_path: &Path, write: bool) -> Result<usize> {
    let catalog = load_catalog(catalog_path)?;
    let content = fs::read_to_string(rows_path)
        .with_context(|| format!("Failed to read rows: {}", rows_path.display()))?;
    let rows: Vec<Value> = serde_json::from_str(&content)
        .with_context(|| format!("{} must hold a JSON array of rows", rows_path.display()))?;

    println!("📥 Checking {} row(s) for step {}", rows.len(), step_id);
    let testcases = match check_rows(&catalog.snapshot(), step_id, rows) {
        Ok(testcases) => testcases,
        Err(ImportError::Rows(failures)) => {
            for failure in &failures {
                println!("  ❌ row {}: {}", failure.index, failure.errors.join("; "));
            }
            bail!("{} row(s) rejected; nothing was imported", failures.len());
        }
        Err(ImportError::Assess(e)) => return Err(e.into()),
    };
    for tc in &testcases {
        println!("  ✅ {} [{}] order {}", tc.display_name(), tc.testcase_type(), tc.order_index);
    }

    let count = testcases.len();
    if write {
        catalog.insert_testcases(step_id, testcases)?;
        write_document(catalog_path, &catalog.snapshot().to_document())?;
        println!("✅ Imported {} test case(s) into {}", count, catalog_path.display());
    } else {
        println!("✅ {} row(s) are valid; re-run with --write to save them", count);
    }
    Ok(count)
}
