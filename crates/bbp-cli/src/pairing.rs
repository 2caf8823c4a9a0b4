use async_trait::async_trait;
use bbp_core::PairingConfirmer;
use bbp_crypto::PairingCode;
use tracing::debug;

use crate::ui::{parse_yes_no, prompt_line};

/// Shows the pairing code and asks the user to compare it with the device screen.
pub struct CliPairingConfirmer {
    pub assume_yes: bool,
}

#[async_trait]
impl PairingConfirmer for CliPairingConfirmer {
    async fn confirm_pairing_code(&self, code: &PairingCode) -> anyhow::Result<bool> {
        println!();
        println!("Pairing code: {code}");
        println!("Check that the device shows the same code.");
        if self.assume_yes {
            debug!("pairing code accepted by --yes");
            return Ok(true);
        }

        // stdin is blocking; keep it off the runtime workers.
        let answer = tokio::task::spawn_blocking(|| -> std::io::Result<bool> {
            loop {
                let input = prompt_line("Does the code match? [y/N]: ")?;
                match parse_yes_no(&input) {
                    Some(answer) => return Ok(answer),
                    None => println!("Please answer y or n."),
                }
            }
        })
        .await??;
        Ok(answer)
    }
}
