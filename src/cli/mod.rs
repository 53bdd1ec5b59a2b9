use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "history-ranker",
    about = "Browsing history store with search-term ranking and top sites"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Record a page visit
    Visit {
        url: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value_t = false)]
        typed: bool,
    },
    /// Record a search with the default provider
    Search { term: String },
    Terms {
        #[command(subcommand)]
        command: TermsCommands,
    },
    Urls {
        #[command(subcommand)]
        command: UrlsCommands,
    },
    TopSites {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Block {
        #[command(subcommand)]
        command: BlockCommands,
    },
    Downloads {
        #[command(subcommand)]
        command: DownloadsCommands,
    },
    Status,
    ImportChrome {
        #[arg(long)]
        profile: Option<String>,
    },
    /// Keep top sites fresh until interrupted
    Service,
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum TermsCommands {
    Recent {
        #[arg(default_value = "")]
        prefix: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
        #[arg(long, default_value_t = false)]
        frecency: bool,
    },
    Repeated {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    Delete {
        term: String,
        /// Also delete the pages the term led to
        #[arg(long, default_value_t = false)]
        urls: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum UrlsCommands {
    Get {
        url: String,
    },
    Delete {
        urls: Vec<String>,
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    Autocomplete {
        prefix: String,
        #[arg(long, default_value_t = 10)]
        count: usize,
        #[arg(long, default_value_t = false)]
        typed_only: bool,
    },
    Significant {
        #[arg(long, default_value_t = 20)]
        count: usize,
    },
    Match {
        query: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum BlockCommands {
    Add { url: String },
    Remove { url: String },
    Clear,
    List,
}

#[derive(Debug, Subcommand)]
pub enum DownloadsCommands {
    List,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    Set { key: String, value: String },
    Get { key: String },
}

/// One line of input to a running `service`.
#[derive(Debug, Parser)]
#[command(name = "service", no_binary_name = true, disable_help_flag = true)]
pub struct ServiceInput {
    #[command(subcommand)]
    pub command: ServiceCommand,
}

#[derive(Debug, Subcommand)]
pub enum ServiceCommand {
    Visit {
        url: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value_t = false)]
        typed: bool,
    },
    Search {
        #[arg(required = true)]
        term: Vec<String>,
    },
    Delete {
        urls: Vec<String>,
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    Block { url: String },
    Unblock { url: String },
    ClearBlocked,
    /// Print the current list
    Top,
}
