use boardshoot::api::types::{Folder, Note, NoteRequest};
use boardshoot::config::Config;
use boardshoot::event::{EventHandler, SyncEvent};
use boardshoot::sync::ProbeOutcome;
use boardshoot::SyncContext;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Log filter variable, e.g. `BOARDSHOOT_LOG=boardshoot=debug`
const LOG_ENV: &str = "BOARDSHOOT_LOG";

#[derive(Parser, Debug)]
#[command(name = "boardshoot")]
#[command(about = "Command-line client for BoardShoot notes and photos")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/boardshoot/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Keep the session and cache in memory only
  #[arg(long, global = true)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sign in and store the session
  Login { username: String, password: String },
  /// Create an account and sign in
  Signup {
    username: String,
    email: String,
    password: String,
  },
  /// Forget the stored session
  Logout,
  /// Show the signed-in user
  Whoami,
  /// Change username and email
  Profile { username: String, email: String },
  #[command(subcommand)]
  Folders(FolderCommand),
  #[command(subcommand)]
  Notes(NoteCommand),
  #[command(subcommand)]
  Images(ImageCommand),
  /// Check whether the API host is reachable
  Probe,
  /// Poll connectivity and print sync events until Ctrl-C
  Watch {
    /// Poll interval in seconds (default from config)
    #[arg(short, long)]
    interval: Option<u64>,
  },
}

#[derive(Subcommand, Debug)]
enum FolderCommand {
  List,
  Create { name: String },
  Delete { id: u64 },
}

#[derive(Subcommand, Debug)]
enum NoteCommand {
  List {
    folder: u64,
  },
  Create {
    folder: u64,
    title: String,
    #[arg(long, default_value = "")]
    text: String,
  },
  Show {
    folder: u64,
    note: u64,
  },
  Edit {
    folder: u64,
    note: u64,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    text: Option<String>,
  },
  Delete {
    folder: u64,
    note: u64,
  },
}

#[derive(Subcommand, Debug)]
enum ImageCommand {
  /// Upload an image file
  Add {
    folder: u64,
    note: u64,
    path: PathBuf,
  },
  /// Set the image order; list every image URL in the new order
  Reorder {
    folder: u64,
    note: u64,
    #[arg(required = true)]
    urls: Vec<String>,
  },
  Delete {
    folder: u64,
    note: u64,
    url: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;

  let mut config = Config::load(args.config.as_deref())?;
  if args.ephemeral {
    config.storage.ephemeral = true;
  }

  let (ctx, mut events) = SyncContext::init(config)?;
  let result = run(&ctx, &mut events, args.command).await;
  ctx.dispose();
  result
}

/// Log to a daily file so stdout carries only command output.
fn init_logging() -> Result<WorkerGuard> {
  let dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("boardshoot");
  std::fs::create_dir_all(&dir).wrap_err_with(|| format!("Failed to create {}", dir.display()))?;

  let appender = tracing_appender::rolling::daily(&dir, "boardshoot.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

async fn run(ctx: &SyncContext, events: &mut EventHandler, command: Command) -> Result<()> {
  let client = ctx.client();

  match command {
    Command::Login { username, password } => {
      let user = client.login(&username, &password).await?;
      println!("Signed in as {}", user.username);
    }
    Command::Signup {
      username,
      email,
      password,
    } => {
      let user = client.signup(&username, &email, &password).await?;
      println!("Created account {} (id {})", user.username, user.id);
    }
    Command::Logout => {
      client.logout()?;
      println!("Signed out");
    }
    Command::Whoami => match client.current_user()? {
      Some(user) => println!("{} <{}> (id {})", user.username, user.email, user.id),
      None => println!("Not signed in"),
    },
    Command::Profile { username, email } => {
      let user = client.update_profile(&username, &email).await?;
      println!("Profile updated: {} <{}>", user.username, user.email);
    }
    Command::Folders(cmd) => folders(ctx, cmd).await?,
    Command::Notes(cmd) => notes(ctx, events, cmd).await?,
    Command::Images(cmd) => images(ctx, events, cmd).await?,
    Command::Probe => {
      let outcome = ctx.prober().probe().await;
      match outcome {
        ProbeOutcome::Reachable => println!("API host reachable"),
        ProbeOutcome::ApiDown => println!("Network is up but the API host is not responding"),
        ProbeOutcome::Offline => println!("Offline"),
      }
    }
    Command::Watch { interval } => {
      let interval = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| ctx.config().connectivity.poll_interval());
      watch(ctx, events, interval).await?;
    }
  }

  Ok(())
}

async fn folders(ctx: &SyncContext, cmd: FolderCommand) -> Result<()> {
  let client = ctx.client();
  match cmd {
    FolderCommand::List => {
      let folders = client.get_folders().await?;
      print_folders(&folders);
    }
    FolderCommand::Create { name } => {
      let folder = client.create_folder(&name).await?;
      println!("Created folder {} (id {})", folder.name, folder.id);
    }
    FolderCommand::Delete { id } => {
      client.delete_folder(id).await?;
      println!("Deleted folder {}", id);
    }
  }
  Ok(())
}

async fn notes(ctx: &SyncContext, events: &mut EventHandler, cmd: NoteCommand) -> Result<()> {
  let client = ctx.client();
  match cmd {
    NoteCommand::List { folder } => {
      let notes = client.get_folder_notes(folder).await?;
      if notes.is_empty() {
        println!("No notes");
      }
      for note in notes {
        println!("{:>6}  {} ({} images)", note.id, note.title, note.image_urls.len());
      }
    }
    NoteCommand::Create { folder, title, text } => {
      let note = client.create_note(folder, &title, &text).await?;
      println!("Created note {} (id {})", note.title, note.id);
    }
    NoteCommand::Show { folder, note } => {
      let note = client.get_note(folder, note).await?;
      print_note(&note);
    }
    NoteCommand::Edit {
      folder,
      note,
      title,
      text,
    } => {
      if title.is_none() && text.is_none() {
        bail!("Nothing to change; pass --title and/or --text");
      }
      let current = client.get_note(folder, note).await?;
      let draft = ctx.note_draft(
        folder,
        note,
        NoteRequest {
          title: current.title,
          text: current.text.unwrap_or_default(),
        },
      );
      if let Some(title) = title {
        draft.set_title(&title)?;
      }
      if let Some(text) = text {
        draft.set_text(&text)?;
      }
      draft.flush().await;
      expect_flushed(events, draft.key())?;
      println!("Saved note {}", note);
    }
    NoteCommand::Delete { folder, note } => {
      client.delete_note(folder, note).await?;
      println!("Deleted note {}", note);
    }
  }
  Ok(())
}

async fn images(ctx: &SyncContext, events: &mut EventHandler, cmd: ImageCommand) -> Result<()> {
  let client = ctx.client();
  match cmd {
    ImageCommand::Add { folder, note, path } => {
      let bytes = read_image(&path)?;
      let note = client.add_image(folder, note, &bytes).await?;
      println!("Uploaded; note now has {} images", note.image_urls.len());
    }
    ImageCommand::Reorder { folder, note, urls } => {
      let current = client.get_note(folder, note).await?;
      let order = ctx.image_order(folder, note, current.image_urls);
      order.reorder(urls)?;
      order.flush().await;
      expect_flushed(events, order.key())?;
      for (i, url) in order.confirmed().iter().enumerate() {
        println!("{:>3}  {}", i + 1, url);
      }
    }
    ImageCommand::Delete { folder, note, url } => {
      let note = client.delete_image(folder, note, &url).await?;
      println!("Deleted; note now has {} images", note.image_urls.len());
    }
  }
  Ok(())
}

async fn watch(ctx: &SyncContext, events: &mut EventHandler, interval: Duration) -> Result<()> {
  ctx.prober().start_polling(interval);
  println!("Watching (every {}s), Ctrl-C to stop", interval.as_secs());

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.next() => match event {
        Some(event) => print_event(&event),
        None => break,
      },
    }
  }

  ctx.prober().stop_polling();
  Ok(())
}

/// Look for the outcome of the flush of `key` among queued events.
fn expect_flushed(events: &mut EventHandler, key: &str) -> Result<()> {
  while let Some(event) = events.try_next() {
    match event {
      SyncEvent::Flushed { key: k } if k == key => return Ok(()),
      SyncEvent::FlushFailed { key: k, message, .. } if k == key => {
        bail!("Changes were not saved and have been reverted: {}", message)
      }
      other => print_event(&other),
    }
  }
  Err(eyre!("No changes were saved"))
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
  std::fs::read(path).wrap_err_with(|| format!("Failed to read {}", path.display()))
}

fn print_folders(folders: &[Folder]) {
  if folders.is_empty() {
    println!("No folders");
  }
  for folder in folders {
    println!("{:>6}  {} ({} notes)", folder.id, folder.name, folder.count);
  }
}

fn print_note(note: &Note) {
  println!("{} (id {})", note.title, note.id);
  if let Some(text) = note.text.as_deref().filter(|t| !t.is_empty()) {
    println!();
    println!("{}", text);
  }
  for text in &note.texts {
    println!("  - {}", text);
  }
  if !note.image_urls.is_empty() {
    println!();
    for (i, url) in note.image_urls.iter().enumerate() {
      println!("{:>3}  {}", i + 1, url);
    }
  }
}

fn print_event(event: &SyncEvent) {
  match event {
    SyncEvent::Flushed { key } => println!("saved {}", key),
    SyncEvent::FlushFailed { key, message, .. } => println!("failed to save {}: {}", key, message),
    SyncEvent::ConnectivityChanged { reachable: true } => println!("online"),
    SyncEvent::ConnectivityChanged { reachable: false } => println!("offline"),
    SyncEvent::SessionExpired => println!("session expired, please log in again"),
  }
}
