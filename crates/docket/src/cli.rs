use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "docket",
    about = "Turn municipal meeting minutes into per-property decision records",
    version
)]
pub struct Cli {
    /// Root of the downloaded source documents
    #[arg(long, env = "DOCKET_SOURCES", default_value = "sources")]
    pub sources: PathBuf,

    /// Root of the stage artifact cache
    #[arg(long, env = "DOCKET_ARTIFACTS", default_value = docket_core::ARTIFACT_ROOT)]
    pub artifacts: PathBuf,

    /// SQLite database receiving parsed records
    #[arg(long, env = "DOCKET_DB", default_value = "docket.db")]
    pub database: String,

    /// Pipeline definition (JSON); the four built-in stages if omitted
    #[arg(long, env = "DOCKET_PIPELINE")]
    pub pipeline: Option<PathBuf>,

    /// Two-letter state code, as used in the source layout
    #[arg(long, env = "DOCKET_STATE_ABBRV", default_value = "NJ")]
    pub state_abbrv: String,

    #[arg(long, env = "DOCKET_STATE", default_value = "New Jersey")]
    pub state: String,

    #[arg(long, env = "DOCKET_CITY", default_value = "Millburn")]
    pub city: String,

    /// Governing body name
    #[arg(long, env = "DOCKET_MUNICIPAL", default_value = "Millburn Township")]
    pub municipal: String,

    /// Document types to process (repeatable)
    #[arg(long = "doctype", default_values_t = [String::from("ZONING")])]
    pub doctypes: Vec<String>,

    /// Years to process (repeatable)
    #[arg(long = "year", required = true)]
    pub years: Vec<String>,

    /// Run the pipeline but skip the database
    #[arg(long)]
    pub no_persist: bool,

    /// Don't print parsed records
    #[arg(short, long)]
    pub quiet: bool,
}
