use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gerrit_stats::{
    approved_then_rebased, classify, load_all_projects, load_project, population_stats,
    BranchFilter, ChangeCache, ClassifiedChange, Config, CoreTeams, GerritClient, Project,
    QueryFilter, ReviewerLedger, Synchronizer, WaitingOn,
};

#[derive(Parser)]
#[command(name = "gerrit-stats")]
#[command(about = "Review statistics for a Gerrit server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Gerrit server base URL
    #[arg(long, default_value = "https://review.opendev.org")]
    server: String,

    /// Gerrit user for authenticated queries
    #[arg(long, env = "GERRIT_USER")]
    user: Option<String>,

    /// Gerrit HTTP password
    #[arg(long, env = "GERRIT_HTTP_PASSWORD")]
    password: Option<String>,

    /// Path to config file
    #[arg(long, default_value = ".gerrit-stats/config.yml")]
    config: PathBuf,

    /// Directory holding project descriptors
    #[arg(long, default_value = "./projects")]
    projects_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Report wait times for open reviews
    OpenReviews {
        /// JSON descriptor of the project to report on
        #[arg(short, long, default_value = "projects/nova.json")]
        project: PathBuf,

        /// Report across all known projects
        #[arg(short, long)]
        all: bool,

        /// Include stable branch changes
        #[arg(short, long)]
        stable: bool,

        /// How many longest-waiting changes to list
        #[arg(short, long, default_value_t = 5)]
        longest_waiting: usize,

        /// Count changes waiting more than this many days
        #[arg(short = 'm', long, default_value_t = 7)]
        waiting_more: i64,
    },

    /// List approved changes that fell out of the gate after a rebase
    OpenApproved {
        /// JSON descriptor of the project to report on
        #[arg(short, long, default_value = "projects/nova.json")]
        project: PathBuf,

        /// Report across all known projects
        #[arg(short, long)]
        all: bool,

        /// Include stable branch changes
        #[arg(short, long)]
        stable: bool,
    },

    /// Report per-reviewer activity and disagreements
    Reviewers {
        /// JSON descriptor of the project to report on
        #[arg(short, long, default_value = "projects/nova.json", conflicts_with = "stable")]
        project: PathBuf,

        /// Report across all known projects
        #[arg(short, long)]
        all: bool,

        /// Report on a stable branch by short name, or "all" for every
        /// open stable branch
        #[arg(short, long, value_name = "BRANCH")]
        stable: Option<String>,

        /// Number of days to consider
        #[arg(short, long, default_value_t = 14)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("gerrit_stats=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let mut client = GerritClient::new(&cli.server).with_retry(
        config.query.connect_attempts,
        Duration::from_secs(config.query.retry_backoff_secs),
    );
    if let (Some(user), Some(password)) = (&cli.user, &cli.password) {
        client = client.with_auth(user, password);
    }

    let cache = ChangeCache::new(
        &config.cache.dir,
        Duration::from_secs(config.cache.max_age_secs),
    )?;

    match &cli.command {
        Commands::OpenReviews {
            project,
            all,
            stable,
            longest_waiting,
            waiting_more,
        } => {
            let projects = select_projects(project, *all, &cli.projects_dir)?;
            open_reviews(
                &client,
                &cache,
                &config,
                &projects,
                *stable,
                *longest_waiting,
                *waiting_more,
            )
            .await?;
        }
        Commands::OpenApproved {
            project,
            all,
            stable,
        } => {
            let projects = select_projects(project, *all, &cli.projects_dir)?;
            open_approved(&client, &cache, &config, &projects, *stable).await?;
        }
        Commands::Reviewers {
            project,
            all,
            stable,
            days,
        } => {
            let projects = if stable.is_some() {
                vec![load_project(cli.projects_dir.join("stable.json"))?]
            } else {
                select_projects(project, *all, &cli.projects_dir)?
            };
            reviewers(&client, &cache, &config, &projects, stable.as_deref(), *days).await?;
        }
    }

    Ok(())
}

fn select_projects(project: &PathBuf, all: bool, projects_dir: &PathBuf) -> Result<Vec<Project>> {
    let projects = if all {
        load_all_projects(projects_dir)?
    } else {
        vec![load_project(project)?]
    };
    if projects.is_empty() {
        anyhow::bail!("No project descriptors found");
    }
    Ok(projects)
}

async fn open_reviews(
    client: &GerritClient,
    cache: &ChangeCache,
    config: &Config,
    projects: &[Project],
    include_stable: bool,
    longest_waiting: usize,
    waiting_more: i64,
) -> Result<()> {
    let sync = Synchronizer::new(client, cache, config.query.clone());
    let changes = sync.fetch_changes(projects, &QueryFilter::open()).await?;

    let now_ts = Utc::now().timestamp();
    let mut waiting_on_reviewer = Vec::new();
    let mut waiting_on_submitter = Vec::new();
    for change in &changes {
        if let Some(classified) = classify(change, now_ts, include_stable) {
            match classified.waiting_on {
                WaitingOn::Reviewer => waiting_on_reviewer.push(classified),
                WaitingOn::Submitter => waiting_on_submitter.push(classified),
            }
        }
    }

    info!(
        reviewer = waiting_on_reviewer.len(),
        submitter = waiting_on_submitter.len(),
        "Classified open changes"
    );

    let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
    println!("Projects: {:?}", names);
    println!(
        "Total Open Reviews: {}",
        waiting_on_reviewer.len() + waiting_on_submitter.len()
    );
    println!("Waiting on Submitter: {}", waiting_on_submitter.len());
    println!("Waiting on Reviewer: {}", waiting_on_reviewer.len());

    print_age_block(
        "Stats since the latest revision",
        &waiting_on_reviewer,
        |c| c.age,
    );
    println!(
        "--> Number waiting more than {} days: {}",
        waiting_more,
        gerrit_stats::timeline::number_waiting_more_than(
            &waiting_on_reviewer,
            waiting_more * 24 * 3600,
            |c| c.age,
        )
    );
    print_age_block(
        "Stats since the last revision without -1 or -2",
        &waiting_on_reviewer,
        |c| c.age3,
    );
    print_age_block(
        "Stats since the first revision (total age)",
        &waiting_on_reviewer,
        |c| c.age2,
    );

    print_longest(
        "Longest waiting reviews (based on latest revision)",
        &waiting_on_reviewer,
        longest_waiting,
        |c| c.age,
    );
    print_longest(
        "Longest waiting reviews (based on oldest rev without -1 or -2)",
        &waiting_on_reviewer,
        longest_waiting,
        |c| c.age3,
    );
    print_longest(
        "Oldest reviews (time since first revision)",
        &waiting_on_reviewer,
        longest_waiting,
        |c| c.age2,
    );

    Ok(())
}

async fn open_approved(
    client: &GerritClient,
    cache: &ChangeCache,
    config: &Config,
    projects: &[Project],
    include_stable: bool,
) -> Result<()> {
    let sync = Synchronizer::new(client, cache, config.query.clone());
    let changes = sync.fetch_changes(projects, &QueryFilter::open()).await?;

    let mut rebased: Vec<String> = changes
        .iter()
        .filter(|c| approved_then_rebased(c, include_stable))
        .map(|c| format!("{} {}", c.url_or_id(), c.subject_or_empty()))
        .collect();
    rebased.sort_unstable();
    rebased.dedup();

    info!(count = rebased.len(), "Found approved-then-rebased changes");

    for line in &rebased {
        println!("{}", line);
    }
    println!("total {}", rebased.len());

    Ok(())
}

fn print_age_block(title: &str, changes: &[ClassifiedChange], key: fn(&ClassifiedChange) -> i64) {
    use gerrit_stats::timeline::{average_age, quartile_age, sec_to_period_string};

    println!("{}:", title);
    println!(
        "--> Average wait time: {}",
        sec_to_period_string(average_age(changes, key))
    );
    println!(
        "--> 1st quartile wait time: {}",
        sec_to_period_string(quartile_age(changes, 1, key))
    );
    println!(
        "--> Median wait time: {}",
        sec_to_period_string(quartile_age(changes, 2, key))
    );
    println!(
        "--> 3rd quartile wait time: {}",
        sec_to_period_string(quartile_age(changes, 3, key))
    );
}

fn print_longest(
    title: &str,
    changes: &[ClassifiedChange],
    count: usize,
    key: fn(&ClassifiedChange) -> i64,
) {
    use gerrit_stats::timeline::sec_to_period_string;

    let mut sorted: Vec<&ClassifiedChange> = changes.iter().collect();
    sorted.sort_by_key(|c| std::cmp::Reverse(key(c)));

    println!("{}:", title);
    for change in sorted.iter().take(count) {
        println!(
            "--> {} {} ({})",
            sec_to_period_string(key(change)),
            change.url,
            change.subject
        );
    }
}

async fn reviewers(
    client: &GerritClient,
    cache: &ChangeCache,
    config: &Config,
    projects: &[Project],
    stable: Option<&str>,
    days: i64,
) -> Result<()> {
    let filter = match stable {
        None => QueryFilter::full_history(),
        Some("all") => QueryFilter {
            open_only: false,
            branch: BranchFilter::AllStable,
        },
        Some(branch) => QueryFilter {
            open_only: false,
            branch: BranchFilter::Stable(branch.to_string()),
        },
    };

    let now_ts = Utc::now().timestamp();
    let cut_off = now_ts - days * 24 * 3600;

    let sync = Synchronizer::new(client, cache, config.query.clone());
    let mut teams = CoreTeams::new();
    let mut ledger = ReviewerLedger::new(cut_off, config.excluded_reviewers.clone());
    let mut all_changes = Vec::new();
    let mut all_core: HashSet<String> = HashSet::new();

    for project in projects {
        let core_team = teams
            .for_project(client, project)
            .await
            .with_context(|| format!("Failed to resolve core team for {}", project.name))?
            .clone();
        all_core.extend(core_team.iter().cloned());

        let changes = sync
            .fetch_changes(std::slice::from_ref(project), &filter)
            .await?;
        for change in &changes {
            for patch_set in &change.patch_sets {
                ledger.record_patch_set(patch_set, &core_team);
            }
        }
        all_changes.extend(changes);
    }

    let stats = population_stats(&all_changes, cut_off, now_ts);
    let rows = ledger.into_rows();

    let scope = match stable {
        Some("all") => "all open stable branches".to_string(),
        Some(branch) => format!("stable/{}", branch),
        None => projects
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    };
    println!("Reviews for the last {} days in {}", days, scope);
    println!("** -- core team member\n");
    println!(
        "{:<24} {:>7}  {:>3} {:>3} {:>3} {:>3} {:>3}   {:>6}  {:>13}  {:>8}",
        "Reviewer", "Reviews", "-2", "-1", "+1", "+2", "+A", "+/- %", "Disagreements", "Received"
    );

    let mut total_reviews = 0;
    let mut core_reviews = 0;
    let mut active_reviewers = 0;
    for (name, stats) in &rows {
        let in_core = all_core.contains(name);
        let display = if in_core {
            format!("{} **", name)
        } else {
            name.clone()
        };
        let received = match stats.received_ratio() {
            Some(ratio) => format!("{} ({:.1}%)", stats.received, ratio),
            None => format!("{} (inf)", stats.received),
        };
        println!(
            "{:<24} {:>7}  {:>3} {:>3} {:>3} {:>3} {:>3}   {:>5.1}%  {:>4} ({:>5.1}%)  {:>8}",
            display,
            stats.total,
            stats.minus_two,
            stats.minus_one,
            stats.plus_one,
            stats.plus_two,
            stats.approvals,
            stats.plus_ratio(),
            stats.disagreements,
            stats.disagreement_ratio(),
            received,
        );

        total_reviews += stats.total;
        if in_core {
            core_reviews += stats.total;
        }
        if stats.total > 0 {
            active_reviewers += 1;
        }
    }

    println!(
        "\nTotal reviews: {} ({:.1}/day)",
        total_reviews,
        total_reviews as f64 / days as f64
    );
    println!(
        "Total reviewers: {} (avg {:.1} reviews/day)",
        active_reviewers,
        if active_reviewers > 0 {
            total_reviews as f64 / days as f64 / active_reviewers as f64
        } else {
            0.0
        }
    );
    println!(
        "Total reviews by core team: {} ({:.1}/day)",
        core_reviews,
        core_reviews as f64 / days as f64
    );
    println!(
        "Core team size: {} (avg {:.1} reviews/day)",
        all_core.len(),
        if all_core.is_empty() {
            0.0
        } else {
            core_reviews as f64 / days as f64 / all_core.len() as f64
        }
    );
    println!(
        "New patch sets in the last {} days: {} ({:.1}/day)",
        days,
        stats.patches,
        stats.patches as f64 / days as f64
    );
    println!(
        "Changes involved in the last {} days: {} ({:.1}/day)",
        days,
        stats.involved,
        stats.involved as f64 / days as f64
    );
    println!("  New changes: {}", stats.created);
    println!("  Changes merged: {}", stats.merged);
    println!("  Changes abandoned: {}", stats.abandoned);
    println!("  Changes left in state WIP: {}", stats.wip);
    println!("  Queue growth: {}", stats.queue_growth());
    println!(
        "  Average number of patches per changeset: {:.1}",
        if stats.involved > 0 {
            stats.patches as f64 / stats.involved as f64
        } else {
            0.0
        }
    );
    println!(
        "\n(*) Disagreements are defined as a +1 or +2 vote on a patch where \
         a core team member later gave a -1 or -2 vote, or a negative vote \
         overridden with a positive one afterwards."
    );

    Ok(())
}
