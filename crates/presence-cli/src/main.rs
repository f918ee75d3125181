use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.presence.Attendance1",
    default_service = "org.presence.Attendance1",
    default_path = "/org/presence/Attendance1"
)]
trait Attendance {
    async fn enroll(
        &self,
        name: &str,
        email: &str,
        role: &str,
        department: &str,
        image: &[u8],
    ) -> zbus::Result<String>;
    async fn recognize(&self, kind: &str, image: &[u8]) -> zbus::Result<String>;
    async fn list_attendance(&self, offset: u32, limit: u32) -> zbus::Result<String>;
    async fn delete_identity(&self, id: &str) -> zbus::Result<String>;
    async fn list_identities(&self, offset: u32, limit: u32) -> zbus::Result<String>;
    async fn update_identity(
        &self,
        id: &str,
        name: &str,
        role: &str,
        department: &str,
    ) -> zbus::Result<String>;
    async fn stats(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    /// (also selected by PRESENCE_BUS=system)
    #[arg(long)]
    system: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new person from a photo
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
        /// Defaults to "employee"
        #[arg(short, long, default_value = "")]
        role: String,
        /// Defaults to "General"
        #[arg(short, long, default_value = "")]
        department: String,
        /// Photo containing the person's face
        image: PathBuf,
    },
    /// Recognize the face in a photo and mark attendance
    Recognize {
        /// IN or OUT
        #[arg(short, long, default_value = "IN")]
        kind: String,
        image: PathBuf,
    },
    /// Show attendance events, newest first
    Attendance {
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// List enrolled people
    Users {
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Change a person's name, role or department
    Update {
        id: String,
        #[arg(short, long, default_value = "")]
        name: String,
        #[arg(short, long, default_value = "")]
        role: String,
        #[arg(short, long, default_value = "")]
        department: String,
    },
    /// Remove a person and their attendance history
    Remove { id: String },
    /// Show gallery and attendance counters
    Stats,
    /// Show daemon status
    Status,
}

fn parse_system_bus(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "session" => Ok(false),
        "system" => Ok(true),
        other => Err(format!("unknown bus {other:?}, expected session or system")),
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading image {}", path.display()))
}

/// Re-indent the daemon's JSON for humans; fall back to the raw text.
fn pretty(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

/// Turn a D-Bus method error into "NoMatch: face not recognized".
fn describe(err: zbus::Error) -> anyhow::Error {
    match err {
        zbus::Error::MethodError(name, detail, _) => {
            let short = name.as_str().rsplit('.').next().unwrap_or(name.as_str()).to_string();
            match detail {
                Some(detail) => anyhow::anyhow!("{short}: {detail}"),
                None => anyhow::anyhow!("{short}"),
            }
        }
        other => anyhow::Error::new(other).context("presenced not reachable"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let system = match std::env::var("PRESENCE_BUS") {
        Ok(v) if !cli.system => parse_system_bus(&v).map_err(anyhow::Error::msg)?,
        _ => cli.system,
    };

    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn).await?;
    tracing::debug!(system_bus = system, "connected");

    let reply = match cli.command {
        Commands::Enroll {
            name,
            email,
            role,
            department,
            image,
        } => {
            let bytes = read_image(&image)?;
            proxy.enroll(&name, &email, &role, &department, &bytes).await
        }
        Commands::Recognize { kind, image } => {
            let bytes = read_image(&image)?;
            proxy.recognize(&kind, &bytes).await
        }
        Commands::Attendance { skip, limit } => proxy.list_attendance(skip, limit).await,
        Commands::Users { skip, limit } => proxy.list_identities(skip, limit).await,
        Commands::Update {
            id,
            name,
            role,
            department,
        } => proxy.update_identity(&id, &name, &role, &department).await,
        Commands::Remove { id } => proxy.delete_identity(&id).await,
        Commands::Stats => proxy.stats().await,
        Commands::Status => proxy.status().await,
    }
    .map_err(describe)?;

    println!("{}", pretty(&reply));
    Ok(())
}
