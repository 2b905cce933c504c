use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Identity the request is made as (falls back to $ROLLCALL_ACTOR)
    #[arg(long = "as", global = true, value_name = "ID")]
    actor: Option<String>,

    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new identity
    Register {
        /// Registration or staff number
        id: String,
        #[arg(long, default_value = "student")]
        role: String,
        #[arg(long)]
        name: String,
        /// Grant full consent at registration
        #[arg(long)]
        consent: bool,
        #[arg(long)]
        year: Option<String>,
        #[arg(long)]
        program: Option<String>,
    },
    /// Enroll or replace a face template from a photo
    Enroll {
        /// Identity being enrolled
        subject: String,
        #[arg(long)]
        photo: PathBuf,
    },
    /// Recognize a face and mark attendance
    Recognize {
        #[arg(long)]
        photo: PathBuf,
        /// Unit or session code (e.g. CS304)
        #[arg(long)]
        unit: String,
        #[arg(long)]
        year: Option<String>,
        #[arg(long)]
        program: Option<String>,
    },
    /// Grant or withdraw consent
    #[command(subcommand)]
    Consent(ConsentCommand),
    /// File a data-subject request (access, restriction, erasure)
    Request {
        subject: String,
        kind: String,
    },
    /// Attendance report (instructor or admin)
    Report(ReportArgs),
    /// One identity's attendance history
    History { subject: String },
    /// Review the audit trail (admin)
    Audit(AuditArgs),
    /// Verify the audit hash chain (admin)
    VerifyAudit,
    /// Delete audit entries older than a cutoff (admin)
    PurgeAudit {
        /// RFC 3339 timestamp
        #[arg(long)]
        before: String,
    },
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum ConsentCommand {
    Grant {
        subject: String,
        #[arg(long)]
        biometric_processing: bool,
        #[arg(long)]
        data_storage: bool,
        #[arg(long)]
        purpose_limitation: bool,
        /// Grant all three
        #[arg(long)]
        all: bool,
    },
    Withdraw { subject: String },
}

#[derive(Args)]
struct ReportArgs {
    #[arg(long)]
    unit: Option<String>,
    #[arg(long)]
    identity: Option<String>,
    /// First day, YYYY-MM-DD
    #[arg(long)]
    from: Option<String>,
    /// Last day, YYYY-MM-DD
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    year: Option<String>,
    #[arg(long)]
    program: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 50)]
    per_page: u32,
}

#[derive(Args)]
struct AuditArgs {
    /// Filter by acting identity
    #[arg(long)]
    by: Option<String>,
    #[arg(long)]
    subject: Option<String>,
    /// e.g. enroll, recognize, erasure_request
    #[arg(long)]
    action: Option<String>,
    #[arg(long)]
    since: Option<String>,
    #[arg(long)]
    until: Option<String>,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 50)]
    per_page: u32,
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn register(&self, request: &str) -> zbus::Result<String>;
    async fn enroll(&self, subject: &str, photo: Vec<u8>) -> zbus::Result<String>;
    async fn recognize(
        &self,
        photo: Vec<u8>,
        unit_code: &str,
        context: &str,
    ) -> zbus::Result<String>;
    async fn grant_consent(&self, actor: &str, subject: &str, flags: &str) -> zbus::Result<String>;
    async fn withdraw_consent(&self, actor: &str, subject: &str) -> zbus::Result<String>;
    async fn data_request(&self, actor: &str, subject: &str, kind: &str) -> zbus::Result<String>;
    async fn attendance_report(&self, actor: &str, query: &str) -> zbus::Result<String>;
    async fn attendance_history(&self, actor: &str, subject: &str) -> zbus::Result<String>;
    async fn audit_log(&self, actor: &str, query: &str) -> zbus::Result<String>;
    async fn verify_audit(&self, actor: &str) -> zbus::Result<String>;
    async fn purge_audit(&self, actor: &str, before: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

impl Cli {
    fn actor(&self) -> Result<String> {
        match &self.actor {
            Some(a) => Ok(a.clone()),
            None => std::env::var("ROLLCALL_ACTOR")
                .context("no actor: pass --as <ID> or set ROLLCALL_ACTOR"),
        }
    }
}

fn report_query(args: &ReportArgs) -> Value {
    json!({
        "unit_code": args.unit,
        "identity": args.identity,
        "from": args.from,
        "to": args.to,
        "year_of_study": args.year,
        "course_program": args.program,
        "page": args.page,
        "per_page": args.per_page,
    })
}

fn audit_query(args: &AuditArgs) -> Value {
    json!({
        "actor": args.by,
        "subject": args.subject,
        "action": args.action,
        "since": args.since,
        "until": args.until,
        "page": args.page,
        "per_page": args.per_page,
    })
}

fn consent_flags(biometric: bool, storage: bool, purpose: bool, all: bool) -> Result<Value> {
    if !(all || biometric || storage || purpose) {
        bail!("nothing to grant: pass --all or at least one consent flag");
    }
    Ok(json!({
        "biometric_processing": all || biometric,
        "data_storage": all || storage,
        "purpose_limitation": all || purpose,
    }))
}

fn read_photo(path: &PathBuf) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("cannot read photo {}", path.display()))
}

/// Pretty-prints a JSON reply; falls back to the raw text.
fn print_reply(reply: &str) {
    match serde_json::from_str::<Value>(reply).and_then(|v| serde_json::to_string_pretty(&v)) {
        Ok(pretty) => println!("{pretty}"),
        Err(_) => println!("{reply}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let builder = if cli.session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    // Recognition waits on the extractor; leave headroom over its timeout.
    let conn = builder
        .method_timeout(Duration::from_secs(30))
        .build()
        .await
        .context("cannot connect to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    let reply = match &cli.command {
        Commands::Register {
            id,
            role,
            name,
            consent,
            year,
            program,
        } => {
            let request = json!({
                "id": id,
                "role": role,
                "display_name": name,
                "consent": {
                    "biometric_processing": consent,
                    "data_storage": consent,
                    "purpose_limitation": consent,
                },
                "year_of_study": year,
                "course_program": program,
            });
            proxy.register(&request.to_string()).await?
        }
        Commands::Enroll { subject, photo } => {
            proxy.enroll(subject, read_photo(photo)?).await?
        }
        Commands::Recognize {
            photo,
            unit,
            year,
            program,
        } => {
            let context = json!({ "year_of_study": year, "course_program": program });
            proxy
                .recognize(read_photo(photo)?, unit, &context.to_string())
                .await?
        }
        Commands::Consent(ConsentCommand::Grant {
            subject,
            biometric_processing,
            data_storage,
            purpose_limitation,
            all,
        }) => {
            let flags =
                consent_flags(*biometric_processing, *data_storage, *purpose_limitation, *all)?;
            proxy
                .grant_consent(&cli.actor()?, subject, &flags.to_string())
                .await?
        }
        Commands::Consent(ConsentCommand::Withdraw { subject }) => {
            proxy.withdraw_consent(&cli.actor()?, subject).await?
        }
        Commands::Request { subject, kind } => {
            proxy.data_request(&cli.actor()?, subject, kind).await?
        }
        Commands::Report(args) => {
            proxy
                .attendance_report(&cli.actor()?, &report_query(args).to_string())
                .await?
        }
        Commands::History { subject } => {
            proxy.attendance_history(&cli.actor()?, subject).await?
        }
        Commands::Audit(args) => {
            proxy
                .audit_log(&cli.actor()?, &audit_query(args).to_string())
                .await?
        }
        Commands::VerifyAudit => proxy.verify_audit(&cli.actor()?).await?,
        Commands::PurgeAudit { before } => proxy.purge_audit(&cli.actor()?, before).await?,
        Commands::Status => proxy.status().await?,
    };

    print_reply(&reply);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_recognize() {
        let cli = Cli::try_parse_from([
            "rollcall", "recognize", "--photo", "face.jpg", "--unit", "CS304", "--year", "3",
        ])
        .unwrap();
        let Commands::Recognize { unit, year, .. } = &cli.command else {
            panic!("expected recognize");
        };
        assert_eq!(unit, "CS304");
        assert_eq!(year.as_deref(), Some("3"));
    }

    #[test]
    fn test_consent_flags_require_something() {
        assert!(consent_flags(false, false, false, false).is_err());
        let flags = consent_flags(false, false, false, true).unwrap();
        assert_eq!(flags["data_storage"], true);
        let flags = consent_flags(true, false, false, false).unwrap();
        assert_eq!(flags["data_storage"], false);
    }

    #[test]
    fn test_report_query_omits_nothing() {
        let cli =
            Cli::try_parse_from(["rollcall", "--as", "L1", "report", "--unit", "cs304"]).unwrap();
        let Commands::Report(args) = &cli.command else {
            panic!("expected report");
        };
        let q = report_query(args);
        assert_eq!(q["unit_code"], "cs304");
        assert!(q["from"].is_null());
        assert_eq!(q["per_page"], 50);
        assert_eq!(cli.actor().unwrap(), "L1");
    }
}
