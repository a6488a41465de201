use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use owo_colors::OwoColorize;
use pad::PadStr;
use tracing::info;

use mfcrack::attack::{AttackOutcome, DictAttackSession};
use mfcrack::classic::{Key, TagSize};
use mfcrack::dict::{KeyDictionary, MemoryDict};
use mfcrack::poller::{Backdoor, NestedPhase, Poller, PollerConfig, PollerMode, PrngType};
use mfcrack::sim::{SharedTag, SimPrng, SimTag};
use mfcrack::view::{DictAttackView, ProgressModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Prng {
    Weak,
    Hard,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a dictionary / nested attack against the built-in simulated tag.
    ///
    /// The hardware transport is out of scope here; the simulator speaks the
    /// full protocol (Crypto1, nested auth, backdoors) and is the same tag
    /// the test suite runs against.
    Attack {
        /// Nested ("enhanced") attack after the plain dictionary pass.
        #[arg(short, long)]
        enhanced: bool,

        /// Simulated PRNG flavor.
        #[arg(long, value_enum, default_value = "weak")]
        prng: Prng,

        /// Give the simulated tag a known auth backdoor.
        #[arg(long)]
        backdoor: bool,

        /// Extra keys for the dictionary, hex, comma separated.
        #[arg(long, value_delimiter = ',')]
        keys: Vec<String>,

        /// RNG seed for the simulated tag.
        #[arg(long, default_value = "1")]
        seed: u64,
    },
}

#[derive(Debug, Parser)]
#[command(name = "mfcrack", about = "Mifare Classic key recovery toolbox")]
struct Opt {
    /// Every time you -v, it gets noisier (up to -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

/// Renders one-line progress snapshots as the attack moves.
#[derive(Default)]
struct ConsoleView {
    model: ProgressModel,
    last_line: String,
}

impl ConsoleView {
    fn render(&mut self) {
        let (ratio, label) = self.model.progress();
        let line = format!(
            "{} | {} | {:3.0}% ({}) | {} | {}",
            self.model.header_line(),
            self.model.status_line(),
            ratio * 100.0,
            label,
            self.model.keys_line(),
            self.model.sectors_line(),
        );
        if line != self.last_line {
            println!("{line}");
            self.last_line = line;
        }
    }
}

impl DictAttackView for ConsoleView {
    fn set_header(&mut self, header: &str) {
        self.model.set_header(header);
    }
    fn set_card_detected(&mut self, detected: bool) {
        self.model.set_card_detected(detected);
        if !detected {
            println!("{}", "Lost the tag!".red());
        }
    }
    fn set_sectors_total(&mut self, total: u8) {
        self.model.set_sectors_total(total);
    }
    fn set_sectors_read(&mut self, read: u8) {
        self.model.set_sectors_read(read);
        self.render();
    }
    fn set_keys_found(&mut self, found: u8) {
        self.model.set_keys_found(found);
        self.render();
    }
    fn set_current_sector(&mut self, sector: u8) {
        self.model.set_current_sector(sector);
    }
    fn set_dict_keys_total(&mut self, total: usize) {
        self.model.set_dict_keys_total(total);
    }
    fn set_dict_keys_current(&mut self, current: usize) {
        self.model.set_dict_keys_current(current);
    }
    fn set_key_attack(&mut self, sector: u8) {
        self.model.set_key_attack(sector);
    }
    fn reset_key_attack(&mut self) {
        self.model.reset_key_attack();
    }
    fn set_nested_phase(&mut self, phase: NestedPhase) {
        self.model.set_nested_phase(phase);
        self.render();
    }
    fn set_prng_type(&mut self, prng: PrngType) {
        self.model.set_prng_type(prng);
    }
    fn set_backdoor(&mut self, backdoor: Backdoor) {
        self.model.set_backdoor(backdoor);
    }
    fn set_nested_target_key(&mut self, target_key: u16) {
        self.model.set_nested_target_key(target_key);
    }
    fn set_msb_count(&mut self, count: u16) {
        self.model.set_msb_count(count);
    }
    fn reset(&mut self) {
        self.model.reset();
    }
}

fn init_logging(opt: &Opt) {
    let filter = match opt.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// A demo tag: sector 0 opens with a well-known key, the rest hide behind
/// keys only the "system" dictionary knows.
fn demo_tag(prng: Prng, backdoor: bool, seed: u64) -> (SharedTag, Vec<u64>) {
    let mut tag = SimTag::new(TagSize::S1k, [0xC0, 0x1D, 0xCA, 0xFE], seed);
    tag.set_prng(match prng {
        Prng::Weak => SimPrng::Weak,
        Prng::Hard => SimPrng::Hard,
    });
    if backdoor {
        tag.set_backdoor(Backdoor::Auth3, Key::from_u64(0xA396EFA4E24F));
    }

    let mut system_keys = Vec::new();
    for sector in 1..16u8 {
        let key_a = 0x0A5EC0000000 + u64::from(sector);
        let key_b = 0x0B5EC0000000 + u64::from(sector);
        tag.set_keys(sector, Key::from_u64(key_a), Key::from_u64(key_b));
        system_keys.push(key_a);
        system_keys.push(key_b);
    }
    tag.set_keys(0, Key::from_u64(0xFFFFFFFFFFFF), Key::from_u64(0x0B5EC0000000));
    system_keys.push(0x0B5EC0000000);
    (SharedTag::new(tag), system_keys)
}

fn cmd_attack(enhanced: bool, prng: Prng, backdoor: bool, keys: Vec<String>, seed: u64) -> Result<()> {
    let (tag, system_keys) = demo_tag(prng, backdoor, seed);

    let mut dict = MemoryDict::builtin();
    let mut extra = Vec::new();
    for text in &keys {
        extra.push(text.parse::<Key>().map_err(|e| anyhow::anyhow!("{e}: {text}"))?);
    }
    if !extra.is_empty() {
        let mut all: Vec<Key> = Vec::new();
        let mut builtin = MemoryDict::builtin();
        while let Some(k) = builtin.next_key() {
            all.push(k);
        }
        all.extend(extra);
        dict = MemoryDict::new(all);
    }

    // The nested filter gets the big "system" list on top of the user dict.
    let mut nested_keys: Vec<Key> = Vec::new();
    let mut user = dict.clone();
    while let Some(k) = user.next_key() {
        nested_keys.push(k);
    }
    nested_keys.extend(system_keys.iter().copied().map(Key::from_u64));
    let nested_dict = MemoryDict::new(nested_keys);

    let mode = if enhanced {
        PollerMode::DictAttackEnhanced
    } else {
        PollerMode::DictAttackStandard
    };
    info!(?mode, dict = dict.total(), nested = nested_dict.total(), "starting attack");

    let mut poller = Poller::new(tag, PollerConfig::default());
    let mut session = DictAttackSession::new(mode, dict, nested_dict, ConsoleView::default());
    let summary = session.run(&mut poller)?;

    println!();
    match &summary.outcome {
        AttackOutcome::Success => println!("{}", "Attack finished.".green().bold()),
        AttackOutcome::Fail(error) => println!("{} {}", "Attack failed:".red().bold(), error),
        AttackOutcome::CardAbsent => println!("{}", "No tag.".red().bold()),
    }
    println!(
        "Keys found: {}/{}  Sectors read: {}/{}",
        summary.keys_found,
        u16::from(summary.sectors_total) * 2,
        summary.sectors_read,
        summary.sectors_total,
    );
    println!();

    let data = poller.data();
    println!(
        "{}  {}  {}  {}",
        "sector".pad_to_width(6),
        "key A".pad_to_width(12),
        "key B".pad_to_width(12),
        "read",
    );
    for sector in 0..data.sector_count() {
        let keys = data.keys_of(sector);
        let fmt = |key: Option<Key>| match key {
            Some(key) => key.to_string().green().to_string(),
            None => "------------".dimmed().to_string(),
        };
        println!(
            "{}  {}  {}  {}",
            sector.to_string().pad_to_width(6),
            fmt(keys.key_a),
            fmt(keys.key_b),
            if data.is_sector_read(sector) { "yes" } else { "no" },
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    init_logging(&opt);
    match opt.cmd {
        Command::Attack { enhanced, prng, backdoor, keys, seed } => {
            cmd_attack(enhanced, prng, backdoor, keys, seed)
        }
    }
}
