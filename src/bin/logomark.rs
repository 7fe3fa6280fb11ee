use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use logomark::{Position, RenderRequest};

#[derive(Parser, Debug)]
#[command(name = "logomark", version, about = "Overlay a logo onto a video")]
struct Cli {
    /// Log debug details (overlay plan, ffmpeg command lines).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Composite a logo over a video and write an MP4 (requires `ffmpeg` and `ffprobe` on PATH).
    Render(RenderArgs),
    /// List the nine anchor positions and their alignments.
    Positions,
    /// Print probed video properties as JSON.
    Probe(ProbeArgs),
    /// Write the RGBA-normalized copy of an overlay image next to it.
    Normalize(NormalizeArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Render request JSON; replaces the individual flags.
    #[arg(long = "in", conflicts_with_all = ["video", "overlay", "out_dir", "name", "position"])]
    in_path: Option<PathBuf>,

    /// Source MP4.
    #[arg(long, required_unless_present = "in_path")]
    video: Option<PathBuf>,

    /// Logo image (PNG, any channel layout).
    #[arg(long, required_unless_present = "in_path")]
    overlay: Option<PathBuf>,

    /// Output directory.
    #[arg(long, required_unless_present = "in_path")]
    out_dir: Option<PathBuf>,

    /// Output file name (must end in .mp4). Defaults to `<video stem>watermarked.mp4`.
    #[arg(long, default_value = "")]
    name: String,

    /// Anchor position, e.g. Top_Left or bottom-right.
    #[arg(long, default_value_t = Position::Center)]
    position: Position,
}

#[derive(Parser, Debug)]
struct ProbeArgs {
    #[arg(long)]
    video: PathBuf,
}

#[derive(Parser, Debug)]
struct NormalizeArgs {
    #[arg(long)]
    overlay: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.cmd {
        Command::Render(args) => cmd_render(args),
        Command::Positions => cmd_positions(),
        Command::Probe(args) => cmd_probe(args),
        Command::Normalize(args) => cmd_normalize(args),
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn read_request_json(path: &Path) -> anyhow::Result<RenderRequest> {
    let f = File::open(path).with_context(|| format!("open request '{}'", path.display()))?;
    let req: RenderRequest = serde_json::from_reader(BufReader::new(f))
        .with_context(|| format!("parse request JSON '{}'", path.display()))?;
    Ok(req)
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let request = match &args.in_path {
        Some(path) => read_request_json(path)?,
        None => RenderRequest::new(
            args.video.unwrap_or_default(),
            args.overlay.unwrap_or_default(),
            args.out_dir.unwrap_or_default(),
            args.name,
            args.position,
        ),
    };

    eprintln!("{}", logomark::STATUS_RENDERING);
    let result = logomark::render_request(request);
    let status = logomark::status_message(&result);

    match result {
        Ok(_) => {
            eprintln!("{status}");
            Ok(())
        }
        Err(err) => {
            eprintln!("{status}");
            Err(err.into())
        }
    }
}

fn cmd_positions() -> anyhow::Result<()> {
    for p in Position::ALL {
        let (h, v) = p.resolve();
        println!("{:<13} {:<7} {}", p.label(), h.as_str(), v.as_str());
    }
    Ok(())
}

fn cmd_probe(args: ProbeArgs) -> anyhow::Result<()> {
    let info = logomark::probe_video(&args.video)?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn cmd_normalize(args: NormalizeArgs) -> anyhow::Result<()> {
    let normalized = logomark::normalize_overlay(&args.overlay)?;
    let (w, h) = normalized.image.dimensions();
    eprintln!("wrote {} ({w}x{h} rgba)", normalized.path.display());
    Ok(())
}
