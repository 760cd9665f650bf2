use crate::infra::{local_service, LocalReviewService};
use clap::Args;
use review_engine::config::{AppConfig, ReviewConfig};
use review_engine::error::AppError;
use review_engine::workflows::review::domain::{ActionId, ApplicationId, ReviewerId, WorkflowId};
use review_engine::workflows::review::{
    LoadReport, ManualStrategy, ReviewSubmission, RuleDecision,
};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Persist the workspace snapshot under this directory instead of in memory.
    #[arg(long)]
    pub(crate) cache_dir: Option<PathBuf>,
    /// Skip the external reviewer session portion of the demo.
    #[arg(long)]
    pub(crate) skip_session: bool,
}

#[derive(Args, Debug, Default)]
pub(crate) struct ExportArgs {
    /// Destination file; prints to stdout when omitted.
    #[arg(long)]
    pub(crate) output: Option<PathBuf>,
}

const INTAKE: [&str; 5] = ["app-101", "app-102", "app-103", "app-104", "app-105"];

fn review_config(cache_dir: Option<PathBuf>) -> Result<ReviewConfig, AppError> {
    let mut config = AppConfig::load()?.review;
    if cache_dir.is_some() {
        config.cache_dir = cache_dir;
    }
    Ok(config)
}

async fn loaded_service(
    config: &ReviewConfig,
) -> Result<(LocalReviewService, LoadReport), AppError> {
    let (service, _mailer) = local_service(config);
    let report = service.load().await?;
    Ok((service, report))
}

fn sheet(academics: u32, impact: u32, is_draft: bool) -> ReviewSubmission {
    ReviewSubmission {
        scores: BTreeMap::from([
            ("academics".to_string(), academics),
            ("impact".to_string(), impact),
        ]),
        is_draft,
        ..ReviewSubmission::default()
    }
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        cache_dir,
        skip_session,
    } = args;

    println!("Review orchestration demo");
    let config = review_config(cache_dir)?;
    let (service, report) = loaded_service(&config).await?;
    println!(
        "Loaded {} applications (cache hit: {})",
        report.applications, report.cache_hit
    );

    let applications: Vec<ApplicationId> = INTAKE
        .iter()
        .map(|raw| ApplicationId(raw.to_string()))
        .collect();
    let entry = service
        .bulk_assign_workflow(
            &applications,
            &WorkflowId("scholarship".to_string()),
            None,
        )
        .await?;
    println!("- {} applications entered stage {}", applications.len(), entry.0);

    let readers = [
        ReviewerId("rev-ada".to_string()),
        ReviewerId("rev-ben".to_string()),
    ];
    let assignment = service
        .assign_manual(&readers, &applications, ManualStrategy::AllToAll)
        .await?;
    for batch in &assignment.completed {
        println!(
            "- {} now holds {} applications (roster v{})",
            batch.reviewer_id.0, batch.assigned, batch.roster_version
        );
    }

    println!("\nReader scores");
    let sheets = [
        ("app-101", sheet(9, 9, false), sheet(8, 9, false)),
        ("app-102", sheet(7, 8, false), sheet(8, 8, false)),
        ("app-103", sheet(5, 6, false), sheet(6, 5, false)),
        ("app-104", sheet(2, 2, false), sheet(3, 2, false)),
        ("app-105", sheet(6, 7, true), sheet(7, 7, false)),
    ];
    for (raw_id, ada, ben) in sheets {
        let application = ApplicationId(raw_id.to_string());
        service
            .submit_via_token("rev_ada00001", &application, &ada)
            .await?;
        let outcome = service
            .submit_via_token("rev_ben00002", &application, &ben)
            .await?;
        let decision = match &outcome.review.rule {
            Some(RuleDecision::Advance { to, .. }) => format!("advanced to {}", to.0),
            Some(RuleDecision::Reject { .. }) => "auto-rejected".to_string(),
            None => "awaiting more reviews".to_string(),
        };
        println!("- {raw_id}: {decision}");
    }

    service
        .execute_action(
            &ApplicationId("app-103".to_string()),
            &ActionId("waitlist".to_string()),
            Some("strong essay, limited funds this round"),
        )
        .await?;
    println!("- app-103 moved to the waitlist");

    println!("\nStage counts");
    for summary in service.stage_summaries().await {
        println!("- {} (#{}): {}", summary.name, summary.order_index, summary.count);
    }

    if !skip_session {
        println!("\nExternal session for rev_cho00003 (finance, blind read)");
        let late = ApplicationId("app-106".to_string());
        service
            .assign_workflow(&late, &WorkflowId("scholarship".to_string()), None)
            .await?;
        service
            .assign_manual(
                &[ReviewerId("rev-cho".to_string())],
                std::slice::from_ref(&late),
                ManualStrategy::EqualSplit,
            )
            .await?;
        let session = service.open_session("rev_cho00003").await?;
        for item in &session.applications {
            println!("- {}", item.view.title);
            for section in &item.view.sections {
                for field in &section.fields {
                    println!(
                        "    {} [{:?}]: {}",
                        field.label, field.visibility, field.value
                    );
                }
            }
        }
    }

    println!("\nAnalytics");
    let report = service.analytics().await;
    for score in &report.applications {
        match score.aggregate_score {
            Some(average) => println!(
                "- {}: {:.1} across {} reviews",
                score.application_id.0, average, score.review_count
            ),
            None => println!("- {}: no completed reviews", score.application_id.0),
        }
    }
    for stats in &report.reviewers {
        println!(
            "- {}: {}/{} complete, mean {}",
            stats.name,
            stats.completed,
            stats.assigned,
            stats
                .mean_total
                .map(|mean| format!("{mean:.1}"))
                .unwrap_or_else(|| "n/a".to_string())
        );
    }

    Ok(())
}

pub(crate) async fn run_export(args: ExportArgs) -> Result<(), AppError> {
    let config = review_config(None)?;
    let (service, _report) = loaded_service(&config).await?;
    let csv = service.export_csv().await?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, csv)?;
            println!("Wrote {}", path.display());
        }
        None => print!("{csv}"),
    }
    Ok(())
}
