mod cli;

use crate::cli::{
    BlockCommands, Cli, Commands, ConfigCommands, DownloadsCommands, ServiceCommand, ServiceInput,
    TermsCommands, UrlsCommands,
};
use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::Parser;
use history_ranker::collector;
use history_ranker::config::Config;
use history_ranker::db::UrlRow;
use history_ranker::history::HistoryService;
use history_ranker::history::task_tracker::CancelableTaskTracker;
use history_ranker::history::types::{MostVisitedUrl, normalize_url};
use history_ranker::search_terms::{KeywordSearchTermVisit, SearchTermRankingPolicy, normalize_term};
use history_ranker::top_sites::block_list::BlockList;
use history_ranker::top_sites::search_provider::SearchProvider;
use history_ranker::top_sites::{
    ChangeReason, TopSites, TopSitesCommand, TopSitesObserver, TopSitesReader, TopSitesSettings,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Visit { url, title, typed } => handle_visit(url, title, typed).await,
        Commands::Search { term } => handle_search(term).await,
        Commands::Terms { command } => handle_terms_command(command).await,
        Commands::Urls { command } => handle_urls_command(command).await,
        Commands::TopSites { json } => handle_top_sites(json).await,
        Commands::Block { command } => handle_block_command(command),
        Commands::Downloads { command } => handle_downloads_command(command).await,
        Commands::Status => handle_status().await,
        Commands::ImportChrome { profile } => handle_import_chrome(profile).await,
        Commands::Service => {
            let config = load_config()?;
            run_service(config).await
        }
        Commands::Config { command } => handle_config_command(command),
    }
}

fn handle_config_command(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Set { key, value } => {
            let mut config = load_config()?;
            config.set_value(&key, &value)?;
            config.ensure_bootstrap_files()?;
            config.save()?;

            println!("Config saved: {key} = {value}");
            Ok(())
        }
        ConfigCommands::Get { key } => {
            let config = load_config()?;
            let value = config
                .get_value(&key)
                .with_context(|| format!("Unsupported config key: {key}"))?;

            println!("{value}");
            Ok(())
        }
    }
}

async fn handle_visit(url: String, title: String, typed: bool) -> Result<()> {
    let config = load_config()?;
    let provider = config.search_provider.clone();
    let service = open_service(&config)?;

    let display_url = normalize_url(&url);
    let (url_id, term) = service
        .run(move |backend| backend.record_visit(&url, &title, Utc::now(), typed, provider.as_ref()))
        .await?;

    println!("Visit recorded: {display_url} (id {url_id})");
    if let Some(term) = term {
        println!("- search term: {term}");
    }
    Ok(())
}

async fn handle_search(term: String) -> Result<()> {
    let config = load_config()?;
    let provider = require_provider(&config)?;
    let service = open_service(&config)?;

    let url = service
        .run(move |backend| backend.record_search(&provider, &term, Utc::now()))
        .await?;

    println!("Search recorded: {url}");
    Ok(())
}

async fn handle_terms_command(command: TermsCommands) -> Result<()> {
    let config = load_config()?;
    let keyword_id = require_provider(&config)?.keyword_id;
    let service = open_service(&config)?;

    match command {
        TermsCommands::Recent {
            prefix,
            count,
            frecency,
        } => {
            let policy = if frecency {
                SearchTermRankingPolicy::Frecency
            } else {
                SearchTermRankingPolicy::Recency
            };
            let terms = service
                .run(move |backend| {
                    backend.get_most_recent_search_terms(keyword_id, &prefix, count, policy, Utc::now())
                })
                .await?;
            print_terms(&terms);
        }
        TermsCommands::Repeated { count } => {
            let terms = service
                .run(move |backend| {
                    backend.query_most_repeated_queries_for_keyword(keyword_id, count, Utc::now())
                })
                .await?;
            print_terms(&terms);
        }
        TermsCommands::Delete { term, urls } => {
            if urls {
                let deleted = service
                    .run(move |backend| backend.delete_matching_urls_for_keyword(keyword_id, &term))
                    .await?;
                println!("Deleted {} URL(s)", deleted.len());
                for url in deleted {
                    println!("- {url}");
                }
            } else {
                let normalized = normalize_term(&term);
                let deleted = service
                    .run(move |backend| {
                        backend
                            .db()
                            .delete_keyword_search_term_for_normalized_term(keyword_id, &normalized)
                    })
                    .await?;
                println!("Deleted {deleted} search term row(s)");
            }
        }
    }

    Ok(())
}

async fn handle_urls_command(command: UrlsCommands) -> Result<()> {
    let config = load_config()?;
    let service = open_service(&config)?;

    match command {
        UrlsCommands::Get { url } => {
            let row = service
                .run(move |backend| backend.db().get_row_for_url(&normalize_url(&url)))
                .await?;
            match row {
                Some(row) => print_url_rows(std::slice::from_ref(&row)),
                None => println!("URL not found"),
            }
        }
        UrlsCommands::Delete { urls, all } => {
            if all {
                let deleted = service.run(|backend| backend.delete_all_history()).await?;
                println!("Deleted all history ({deleted} URL(s))");
            } else {
                let deleted = service.run(move |backend| backend.delete_urls(&urls)).await?;
                println!("Deleted {} URL(s)", deleted.len());
            }
        }
        UrlsCommands::Autocomplete {
            prefix,
            count,
            typed_only,
        } => {
            let rows = service
                .run(move |backend| backend.db().autocomplete_for_prefix(&prefix, count, typed_only))
                .await?;
            print_url_rows(&rows);
        }
        UrlsCommands::Significant { count } => {
            let rows = service
                .run(move |backend| {
                    let mut cursor = backend.db().significant_urls(Utc::now(), count)?;
                    let rows = cursor.rows()?.collect::<Vec<_>>();
                    Ok(rows)
                })
                .await?;
            print_url_rows(&rows);
        }
        UrlsCommands::Match { query } => {
            let rows = service
                .run(move |backend| backend.db().get_text_matches(&query))
                .await?;
            print_url_rows(&rows);
        }
    }

    Ok(())
}

async fn handle_top_sites(json: bool) -> Result<()> {
    let config = load_config()?;
    let sites = match open_service(&config) {
        Ok(service) => {
            let block_list = BlockList::load(&config.block_list_path)?;
            let mut top_sites = TopSites::new(
                Arc::new(service),
                TopSitesSettings::from_config(&config),
                block_list,
            );
            top_sites.load_and_refresh().await;
            let sites = top_sites.reader().most_visited_urls().await;
            top_sites.shutdown();
            sites
        }
        Err(error) => {
            warn!(error = %error, "History unavailable; top sites are empty");
            Vec::new()
        }
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&sites).context("Failed to serialize top sites")?
        );
    } else {
        print_top_sites(&sites);
    }
    Ok(())
}

fn handle_block_command(command: BlockCommands) -> Result<()> {
    let config = load_config()?;
    let mut block_list = BlockList::load(&config.block_list_path)?;

    match command {
        BlockCommands::Add { url } => {
            if block_list.add(&url)? {
                println!("Blocked: {}", normalize_url(&url));
            } else {
                println!("Already blocked: {}", normalize_url(&url));
            }
        }
        BlockCommands::Remove { url } => {
            if block_list.remove(&url)? {
                println!("Unblocked: {}", normalize_url(&url));
            } else {
                println!("Not blocked: {}", normalize_url(&url));
            }
        }
        BlockCommands::Clear => {
            block_list.clear()?;
            println!("Block list cleared");
        }
        BlockCommands::List => {
            println!("{} blocked URL hash(es)", block_list.len());
            for hash in block_list.hashes() {
                println!("- {hash}");
            }
        }
    }

    Ok(())
}

async fn handle_downloads_command(command: DownloadsCommands) -> Result<()> {
    let config = load_config()?;
    let service = open_service(&config)?;

    match command {
        DownloadsCommands::List => {
            let downloads = service
                .run(|backend| backend.db().query_downloads())
                .await?;
            if downloads.is_empty() {
                println!("No downloads");
            }
            for download in downloads {
                println!(
                    "{}\t{:?}\t{}/{}\t{}\t{}",
                    download.id,
                    download.state,
                    download.received_bytes,
                    download.total_bytes,
                    download.url_chain.last().map(String::as_str).unwrap_or("-"),
                    download.target_path
                );
            }
        }
    }

    Ok(())
}

async fn handle_status() -> Result<()> {
    let config = load_config()?;
    let block_list = BlockList::load(&config.block_list_path)?;

    println!("history-ranker status");
    println!("- config: {}", Config::config_path()?.display());
    println!("- database: {}", config.db_path.display());
    println!("- blocked_urls: {}", block_list.len());
    println!(
        "- search_provider: {}",
        config
            .search_provider
            .as_ref()
            .map(|provider| format!("{} (keyword {})", provider.name, provider.keyword_id))
            .unwrap_or_else(|| "none".to_string())
    );

    match open_service(&config) {
        Ok(service) => {
            let (version, compatible, urls, downloads) = service
                .run(|backend| {
                    let db = backend.db();
                    Ok((
                        db.version()?,
                        db.compatible_version()?,
                        db.count_urls()?,
                        db.count_downloads()?,
                    ))
                })
                .await?;
            println!("- schema_version: {version} (compatible {compatible})");
            println!("- urls: {urls}");
            println!("- downloads: {downloads}");
        }
        Err(error) => println!("- database_error: {error:#}"),
    }

    Ok(())
}

async fn handle_import_chrome(profile: Option<String>) -> Result<()> {
    let config = load_config()?;
    let service = open_service(&config)?;

    let import_config = config.clone();
    let summary = service
        .run(move |backend| {
            collector::import_chrome_profiles(backend, &import_config, profile.as_deref())
        })
        .await?;

    println!(
        "Imported {} URL(s) and {} search term(s)",
        summary.urls, summary.terms
    );
    let detected = collector::chrome::detect_chrome_profiles();
    if !detected.is_empty() {
        println!("- detected profiles: {}", detected.join(", "));
    }
    Ok(())
}

struct LoggingObserver;

impl TopSitesObserver for LoggingObserver {
    fn top_sites_loaded(&mut self) {
        info!("Top sites ready");
    }

    fn top_sites_changed(&mut self, reason: ChangeReason) {
        info!(reason = ?reason, "Top sites updated");
    }
}

async fn run_service(config: Config) -> Result<()> {
    config.ensure_bootstrap_files()?;
    let service = Arc::new(open_service(&config)?);
    let block_list = BlockList::load(&config.block_list_path)?;

    let mut top_sites = TopSites::new(
        service.clone(),
        TopSitesSettings::from_config(&config),
        block_list,
    );
    top_sites.add_observer(Box::new(LoggingObserver));

    let stop_input = CancellationToken::new();
    let input = tokio::spawn(read_service_input(
        service,
        config.search_provider.clone(),
        top_sites.command_sender(),
        top_sites.reader(),
        stop_input.clone(),
    ));

    info!("history-ranker service started");
    top_sites
        .run(async {
            if let Err(error) = signal::ctrl_c().await {
                warn!(error = %error, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await;

    stop_input.cancel();
    if let Err(error) = input.await {
        warn!(error = %error, "service input task failed");
    }

    let reader = top_sites.reader();
    print_top_sites(&reader.most_visited_urls().await);
    Ok(())
}

/// Reads service commands from stdin, one per line, until `stop` fires.
/// Closing stdin only stops the input; the refresh loop keeps running.
async fn read_service_input(
    service: Arc<HistoryService>,
    provider: Option<SearchProvider>,
    commands: UnboundedSender<TopSitesCommand>,
    reader: TopSitesReader,
    stop: CancellationToken,
) {
    let tracker = CancelableTaskTracker::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                warn!(error = %error, "failed to read service input");
                break;
            }
        };

        let words = line.split_whitespace().collect::<Vec<_>>();
        if words.is_empty() {
            continue;
        }
        let command = match ServiceInput::try_parse_from(words) {
            Ok(input) => input.command,
            Err(error) => {
                eprintln!("{error}");
                continue;
            }
        };

        if let Err(error) =
            apply_service_command(&service, provider.as_ref(), &commands, &reader, &tracker, command)
                .await
        {
            warn!(error = %error, "service command failed");
        }
    }

    tracker.try_cancel_all();
}

async fn apply_service_command(
    service: &HistoryService,
    provider: Option<&SearchProvider>,
    commands: &UnboundedSender<TopSitesCommand>,
    reader: &TopSitesReader,
    tracker: &CancelableTaskTracker,
    command: ServiceCommand,
) -> Result<()> {
    let top_sites_command = match command {
        ServiceCommand::Visit { url, title, typed } => {
            let provider = provider.cloned();
            let (url_id, term) = service
                .run(move |backend| {
                    backend.record_visit(&url, &title, Utc::now(), typed, provider.as_ref())
                })
                .await?;
            info!(url_id, term = ?term, "Visit recorded");
            TopSitesCommand::NavigationCommitted
        }
        ServiceCommand::Search { term } => {
            let provider = provider
                .cloned()
                .context("No default search provider configured")?;
            let term = term.join(" ");
            let url = service
                .run(move |backend| backend.record_search(&provider, &term, Utc::now()))
                .await?;
            info!(url = %url, "Search recorded");
            TopSitesCommand::NavigationCommitted
        }
        ServiceCommand::Delete { all: true, .. } => {
            let deleted = service.run(|backend| backend.delete_all_history()).await?;
            info!(deleted, "Deleted all history");
            TopSitesCommand::HistoryDeleted {
                all_history: true,
                urls: Vec::new(),
            }
        }
        ServiceCommand::Delete { urls, all: false } => {
            let deleted = service.run(move |backend| backend.delete_urls(&urls)).await?;
            info!(deleted = deleted.len(), "Deleted history");
            TopSitesCommand::HistoryDeleted {
                all_history: false,
                urls: deleted,
            }
        }
        ServiceCommand::Block { url } => TopSitesCommand::Block(url),
        ServiceCommand::Unblock { url } => TopSitesCommand::Unblock(url),
        ServiceCommand::ClearBlocked => TopSitesCommand::ClearBlocked,
        ServiceCommand::Top => {
            reader.get_most_visited_urls_cancelable(tracker, |sites| print_top_sites(&sites));
            return Ok(());
        }
    };

    commands
        .send(top_sites_command)
        .context("Top sites loop has stopped")
}

fn open_service(config: &Config) -> Result<HistoryService> {
    HistoryService::open(config)
        .with_context(|| format!("Failed to open history: {}", config.db_path.display()))
}

fn require_provider(config: &Config) -> Result<SearchProvider> {
    config
        .search_provider
        .clone()
        .context("No default search provider. Set one with `config set search.keyword_id <id>`.")
}

fn load_config() -> Result<Config> {
    Config::load_or_init().context("Failed to load config")
}

fn print_terms(terms: &[KeywordSearchTermVisit]) {
    if terms.is_empty() {
        println!("No search terms");
    }
    for term in terms {
        let score = term
            .score
            .map(|score| format!("{score:.3}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\tvisits={}\tlast={}\tscore={}",
            term.term,
            term.visit_count,
            term.last_visit_time.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            score
        );
    }
}

fn print_url_rows(rows: &[UrlRow]) {
    if rows.is_empty() {
        println!("No URLs");
    }
    for row in rows {
        println!(
            "{}\t{}\tvisits={}\ttyped={}\tlast={}\t{}",
            row.id,
            row.url,
            row.visit_count,
            row.typed_count,
            row.last_visit.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            row.title
        );
    }
}

fn print_top_sites(sites: &[MostVisitedUrl]) {
    if sites.is_empty() {
        println!("No top sites");
    }
    for (rank, site) in sites.iter().enumerate() {
        println!("{:>2}. {}\t{:.3}\t{}", rank + 1, site.url, site.score, site.title);
    }
}
