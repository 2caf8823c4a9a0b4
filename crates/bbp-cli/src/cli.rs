use std::path::PathBuf;

use bbp_sim::Behaviour;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "bbp")]
#[command(about = "BitBox pairing and anti-klepto signing against a simulated device")]
pub struct Cli {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pair with the device and remember the channel.
    Pair(PairArgs),
    /// Print device information.
    Info(InfoArgs),
    /// Fetch a public key.
    Pubkey(PubkeyArgs),
    /// Sign with the anti-klepto protocol.
    Sign(SignArgs),
}

/// Simulated firmware behaviour, for trying out failure handling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum SimBehaviour {
    #[default]
    Honest,
    SignatureFirst,
    DuplicateCommitment,
    TamperNonce,
    WrongCode,
    RejectPairing,
    Silent,
    Busy,
    UserAbort,
}

impl From<SimBehaviour> for Behaviour {
    fn from(behaviour: SimBehaviour) -> Self {
        match behaviour {
            SimBehaviour::Honest => Behaviour::Honest,
            SimBehaviour::SignatureFirst => Behaviour::SignatureBeforeCommitment,
            SimBehaviour::DuplicateCommitment => Behaviour::DuplicateCommitment,
            SimBehaviour::TamperNonce => Behaviour::TamperHostNonce,
            SimBehaviour::WrongCode => Behaviour::WrongPairingCode,
            SimBehaviour::RejectPairing => Behaviour::RejectPairing,
            SimBehaviour::Silent => Behaviour::Silent,
            SimBehaviour::Busy => Behaviour::BusyOnce,
            SimBehaviour::UserAbort => Behaviour::UserAbort,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    #[arg(long, default_value = crate::config::DEFAULT_DEVICE_ID)]
    pub device_id: String,
    #[arg(long)]
    pub storage_path: Option<PathBuf>,
    /// Simulator seed, 32 bytes hex.
    #[arg(long)]
    pub seed: Option<String>,
    #[arg(long, value_enum, default_value_t = SimBehaviour::Honest)]
    pub behaviour: SimBehaviour,
    /// Start the simulated device locked.
    #[arg(long)]
    pub locked: bool,
    /// Accept the pairing code without prompting.
    #[arg(short, long)]
    pub yes: bool,
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout_secs: u64,
    #[arg(long, default_value_t = 120)]
    pub timeout_secs: u64,
}

#[derive(Args, Debug)]
pub struct PairArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Drop any remembered channel first.
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Coin {
    Eth,
    Btc,
    Tbtc,
}

#[derive(Args, Debug)]
pub struct PubkeyArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long, value_enum)]
    pub coin: Coin,
    #[arg(long)]
    pub path: String,
    #[arg(long, default_value_t = 1)]
    pub chain_id: u64,
    /// Bitcoin only: taproot instead of native segwit.
    #[arg(long)]
    pub taproot: bool,
    /// Show the key on the device screen.
    #[arg(long)]
    pub display: bool,
}

#[derive(Args, Debug)]
pub struct SignArgs {
    #[command(subcommand)]
    pub command: SignCommand,
}

#[derive(Subcommand, Debug)]
pub enum SignCommand {
    /// Sign an Ethereum transaction given as JSON, or `@file`.
    Eth(SignEthArgs),
    /// Sign EIP-712 typed data given as its two hashes.
    TypedData(SignTypedDataArgs),
    /// Sign a Bitcoin input sighash.
    Btc(SignBtcArgs),
}

#[derive(Args, Debug)]
pub struct SignEthArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long)]
    pub path: String,
    #[arg(long)]
    pub tx: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SignTypedDataArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long)]
    pub path: String,
    #[arg(long, default_value_t = 1)]
    pub chain_id: u64,
    #[arg(long)]
    pub domain_hash: String,
    #[arg(long)]
    pub message_hash: String,
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SignBtcArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    #[arg(long)]
    pub path: String,
    #[arg(long)]
    pub sighash: String,
    #[arg(long)]
    pub testnet: bool,
    #[arg(long)]
    pub taproot: bool,
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sign_btc() {
        let cli = Cli::try_parse_from([
            "bbp",
            "-vv",
            "sign",
            "btc",
            "--path",
            "m/86'/0'/0'/0/0",
            "--sighash",
            "00",
            "--taproot",
            "--behaviour",
            "tamper-nonce",
            "--yes",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Sign(SignArgs {
            command: SignCommand::Btc(args),
        }) = cli.command
        else {
            panic!("expected sign btc");
        };
        assert!(args.taproot && args.device.yes);
        assert_eq!(
            Behaviour::from(args.device.behaviour),
            Behaviour::TamperHostNonce
        );
    }

    #[test]
    fn pubkey_requires_coin() {
        assert!(Cli::try_parse_from(["bbp", "pubkey", "--path", "m/0"]).is_err());
    }

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
