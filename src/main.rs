use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use vast_ad_engine::ad_break::AdPodInfo;
use vast_ad_engine::async_api;
use vast_ad_engine::fetch::{AdTagFetcher, HttpFetcher};
use vast_ad_engine::{
    AdBreak, AdMediaInfo, AdsLoader, AdsRequest, ContentPosition, EngineConfig, PlayerCallbacks, VideoAdPlayer,
    VideoProgressUpdate,
};

/// VAST/VMAP ad engine
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    debug: bool,

    /// Redirect hops allowed per chain
    #[arg(long, global = true)]
    max_redirects: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a VMAP or VAST file or URL and list its ad breaks
    Parse {
        /// Path to the ad response or ad tag URL
        #[arg(short, long)]
        input: String,

        /// Print the full break structures
        #[arg(short, long)]
        pretty: bool,
    },

    /// Resolve every redirect and list the playable ads of each break
    Resolve {
        /// Path to the ad response or ad tag URL
        #[arg(short, long)]
        input: String,
    },

    /// Play the ad breaks against a simulated content stream
    Simulate {
        /// Path to the ad response or ad tag URL
        #[arg(short, long)]
        input: String,

        /// Content length in seconds
        #[arg(long, default_value_t = 60)]
        content_secs: u64,

        /// Content advanced per tick, in milliseconds
        #[arg(long, default_value_t = 1000)]
        step_ms: u64,

        /// Target bitrate for media selection
        #[arg(long)]
        bitrate: Option<u32>,
    },
}

/// Plays every ad instantly, reporting progress in four steps
struct ConsolePlayer {
    callbacks: OnceLock<PlayerCallbacks>,
}

impl VideoAdPlayer for ConsolePlayer {
    fn load_ad(&self, media: &AdMediaInfo, pod_info: &AdPodInfo) {
        println!(
            "  load  {} (ad {} of {}, pod {})",
            media.url, pod_info.position, pod_info.total_ads, pod_info.pod_index
        );
    }

    fn play_ad(&self, media: &AdMediaInfo) {
        println!("  play  {}", media.url);
        let Some(callbacks) = self.callbacks.get().cloned() else {
            return;
        };
        let media = media.clone();
        tokio::spawn(async move {
            for quarter in 1..=4 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                callbacks.on_progress(&media, VideoProgressUpdate::from_millis(quarter * 2_500, 10_000));
            }
            callbacks.on_ended(&media);
        });
    }

    fn pause_ad(&self, media: &AdMediaInfo) {
        println!("  pause {}", media.url);
    }

    fn stop_ad(&self, media: &AdMediaInfo) {
        println!("  stop  {}", media.url);
    }
}

fn print_break(ad_break: &AdBreak) {
    println!(
        "{} at {} (pod {}): {} ads listed, {} total{}",
        ad_break.id,
        ad_break.offset.seconds(None),
        ad_break.pod_index,
        ad_break.ads().len(),
        ad_break.total_ads(),
        if ad_break.pending_redirect().is_some() { ", redirects pending" } else { "" }
    );
    for ad in ad_break.ads() {
        println!(
            "  [{}] {} {} ({:?}, {} media files)",
            ad.pod_info.position,
            ad.ad_id,
            ad.title.as_deref().unwrap_or("untitled"),
            ad.duration(),
            ad.media_files().len()
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config.debug |= cli.debug;
    if let Some(max_redirects) = cli.max_redirects {
        config.max_redirects = max_redirects.max(1);
    }

    let mut logger = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) if !config.debug => logger.parse_filters(&filters),
        _ if config.debug => logger.filter_level(log::LevelFilter::Debug),
        _ => logger.filter_level(log::LevelFilter::Info),
    };
    logger.init();

    let fetcher: Arc<dyn AdTagFetcher> = Arc::new(HttpFetcher::new(config.http_timeout(), &config.user_agent)?);

    match cli.command {
        Commands::Parse { input, pretty } => {
            let document = async_api::fetch_ad_response(fetcher.as_ref(), &input).await?;
            if pretty {
                println!("{:#?}", document);
            } else {
                for ad_break in &document.ad_breaks {
                    print_break(ad_break);
                }
            }
        }
        Commands::Resolve { input } => {
            let document = async_api::fetch_ad_response(fetcher.as_ref(), &input).await?;
            let resolved = async_api::resolve_ad_breaks(
                fetcher,
                document.ad_breaks,
                config.max_redirects,
                config.vast_load_timeout(),
            )
            .await;
            for (ad_break, error) in &resolved {
                print_break(ad_break);
                if let Some(error) = error {
                    println!("  error: {} (code {})", error, error.code().value());
                }
            }
        }
        Commands::Simulate {
            input,
            content_secs,
            step_ms,
            bitrate,
        } => {
            if bitrate.is_some() {
                config.bitrate_kbps = bitrate;
            }
            let player = Arc::new(ConsolePlayer {
                callbacks: OnceLock::new(),
            });
            let loader = AdsLoader::with_fetcher(config, fetcher);
            let mut manager = loader.request_ads(AdsRequest::AdTagUrl(input), player.clone()).await?;
            let _ = player.callbacks.set(manager.callbacks());
            println!("Cue points: {:?}", manager.ad_cue_points());

            let mut events = manager.subscribe();
            let printer = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    println!("{event}");
                }
            });

            let content = Duration::from_secs(content_secs);
            let step = step_ms.max(1);
            let mut position = 0;
            let mut content_ended = false;
            loop {
                let paused = manager.active_break().is_some_and(|b| b.is_content_paused());
                if !paused {
                    if content_ended && manager.active_break().is_none_or(|b| b.is_ended()) {
                        break;
                    }
                    if position > content.as_millis() as u64 {
                        if !content_ended {
                            println!("content ended");
                            content_ended = true;
                        }
                        manager.on_content_progress(ContentPosition::End, Some(content));
                    } else {
                        manager.on_content_progress(ContentPosition::Millis(position), Some(content));
                        position += step;
                    }
                }
                tokio::select! {
                    _ = manager.next_message() => {}
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }

            manager.destroy();
            drop(manager);
            printer.await?;
        }
    }

    Ok(())
}
