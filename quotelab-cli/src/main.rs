//! QuoteLab CLI — run backtests over CSV quote bars, or generate synthetic
//! data to experiment with.
//!
//! Commands:
//! - `run` — replay a CSV of two-sided quote bars through the demo
//!   SMA-crossover strategy and print the result as JSON
//! - `synth` — generate a random-walk quote CSV

mod config;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use log::info;
use serde::{Deserialize, Serialize};

use quotelab_core::domain::bar::{Bar, Bars, Ohlc};
use quotelab_core::feed::{synthetic, InMemoryFeed};
use quotelab_core::strategy::position::PositionId;
use quotelab_core::strategy::{Context, Session, Strategy};

use config::RunConfig;

#[derive(Parser)]
#[command(name = "quotelab", about = "QuoteLab CLI — quote-bar backtesting engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a CSV of quote bars through the demo SMA-cross strategy.
    Run {
        /// Path to a CSV of quote bars (see `synth` for the format).
        #[arg(long)]
        bars: PathBuf,

        /// Path to a TOML run config.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured initial cash.
        #[arg(long)]
        cash: Option<f64>,

        /// Override the configured instrument name.
        #[arg(long)]
        instrument: Option<String>,
    },
    /// Generate a synthetic random-walk quote CSV.
    Synth {
        /// Output CSV path.
        #[arg(long)]
        out: PathBuf,

        /// Number of daily bars to generate.
        #[arg(long, default_value_t = 500)]
        days: usize,

        /// RNG seed; the same seed reproduces the same series.
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Instrument name written into the config, for reference.
        #[arg(long, default_value = "eurusd")]
        instrument: String,
    },
}

/// One CSV row; timestamps are RFC 3339.
#[derive(Debug, Serialize, Deserialize)]
struct QuoteRow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    ask_open: f64,
    ask_high: f64,
    ask_low: f64,
    ask_close: f64,
    bid_open: f64,
    bid_high: f64,
    bid_low: f64,
    bid_close: f64,
    volume: f64,
}

/// Summary printed after a run.
#[derive(Debug, Serialize)]
struct RunResult {
    initial_cash: f64,
    final_equity: f64,
    final_cash: f64,
    pnl: f64,
    round_trips: usize,
    bars: usize,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            bars,
            config,
            cash,
            instrument,
        } => run_backtest(&bars, config.as_deref(), cash, instrument),
        Commands::Synth {
            out,
            days,
            seed,
            instrument,
        } => write_synthetic(&out, days, seed, &instrument),
    }
}

fn run_backtest(
    bars_path: &Path,
    config_path: Option<&Path>,
    cash_override: Option<f64>,
    instrument_override: Option<String>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str::<RunConfig>(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => RunConfig::default(),
    };
    if let Some(cash) = cash_override {
        config.initial_cash = cash;
    }
    if let Some(instrument) = instrument_override {
        config.instrument = instrument;
    }

    let bars = load_bars(bars_path, &config.instrument)?;
    if bars.len() < 2 {
        bail!("need at least two bars to run, got {}", bars.len());
    }
    info!(
        "running sma({}, {}) over {} bars of {}",
        config.fast,
        config.slow,
        bars.len(),
        config.instrument
    );

    let bar_count = bars.len();
    let strategy = SmaCross::new(config.instrument.clone(), config.fast, config.slow, config.quantity);
    let mut session = Session::with_commission_and_rounding(
        InMemoryFeed::new(bars),
        strategy,
        config.initial_cash,
        config.commission.build(),
        config.rounding.build(),
    );
    session.run()?;

    let final_equity = session.result()?;
    let final_cash = session.broker().borrow().cash(true)?;
    let result = RunResult {
        initial_cash: config.initial_cash,
        final_equity,
        final_cash,
        pnl: final_equity - config.initial_cash,
        round_trips: session.strategy().round_trips,
        bars: bar_count,
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn load_bars(path: &Path, instrument: &str) -> Result<Vec<Bars>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let mut out = Vec::new();
    for (line, row) in reader.deserialize::<QuoteRow>().enumerate() {
        let row = row.with_context(|| format!("row {} of {}", line + 1, path.display()))?;
        let bar = Bar::new(
            row.start,
            row.end,
            Ohlc {
                open: row.ask_open,
                high: row.ask_high,
                low: row.ask_low,
                close: row.ask_close,
            },
            Ohlc {
                open: row.bid_open,
                high: row.bid_high,
                low: row.bid_low,
                close: row.bid_close,
            },
            row.volume,
        )
        .map_err(|err| anyhow::anyhow!("row {}: {err}", line + 1))?;
        let mut map = HashMap::new();
        map.insert(instrument.to_string(), bar);
        out.push(Bars::new(map).map_err(|err| anyhow::anyhow!("row {}: {err}", line + 1))?);
    }
    Ok(out)
}

fn write_synthetic(path: &Path, days: usize, seed: u64, instrument: &str) -> Result<()> {
    let start = Utc
        .with_ymd_and_hms(2015, 1, 1, 0, 0, 0)
        .single()
        .context("building the series start timestamp")?;
    let series = synthetic::daily_series(seed, &[instrument], start, days)?;

    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for bars in &series {
        let bar = bars
            .bar(instrument)
            .context("generated set is missing its instrument")?;
        writer.serialize(QuoteRow {
            start: bar.start(),
            end: bar.end(),
            ask_open: bar.ask().open,
            ask_high: bar.ask().high,
            ask_low: bar.ask().low,
            ask_close: bar.ask().close,
            bid_open: bar.bid().open,
            bid_high: bar.bid().high,
            bid_low: bar.bid().low,
            bid_close: bar.bid().close,
            volume: bar.volume(),
        })?;
    }
    writer.flush()?;
    info!("wrote {} bars of {} to {}", days, instrument, path.display());
    Ok(())
}

/// Demo strategy: long when the fast SMA is above the slow SMA, flat
/// otherwise.
struct SmaCross {
    instrument: String,
    fast: usize,
    slow: usize,
    quantity: f64,
    closes: Vec<f64>,
    position: Option<PositionId>,
    round_trips: usize,
}

impl SmaCross {
    fn new(instrument: String, fast: usize, slow: usize, quantity: f64) -> Self {
        Self {
            instrument,
            fast,
            slow,
            quantity,
            closes: Vec::new(),
            position: None,
            round_trips: 0,
        }
    }

    fn sma(&self, period: usize) -> Option<f64> {
        if period == 0 || self.closes.len() < period {
            return None;
        }
        let window = &self.closes[self.closes.len() - period..];
        Some(window.iter().sum::<f64>() / period as f64)
    }
}

impl Strategy for SmaCross {
    fn on_bars(&mut self, ctx: &mut Context<'_>, _datetime: DateTime<Utc>, bars: &Bars) {
        let Some(bar) = bars.bar(&self.instrument) else {
            return;
        };
        self.closes.push(bar.price());
        let (Some(fast), Some(slow)) = (self.sma(self.fast), self.sma(self.slow)) else {
            return;
        };

        match self.position {
            None if fast > slow => {
                self.position = ctx
                    .enter_long(&self.instrument, self.quantity, true, false)
                    .ok();
            }
            Some(position) if fast < slow => {
                if ctx.exit_market(position, None).is_ok() {
                    self.position = None;
                }
            }
            _ => {}
        }
    }

    fn on_exit_ok(&mut self, _ctx: &mut Context<'_>, _position: PositionId) {
        self.round_trips += 1;
    }
}
