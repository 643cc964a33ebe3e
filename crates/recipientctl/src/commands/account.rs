use anyhow::{Context, Result};
use recipients::{RecipientAddress, RecipientId};
use serde::Serialize;

use crate::config::Config;
use crate::output::Output;
use crate::storage::Storage;

#[derive(Serialize)]
struct AccountResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    self_recipient: Option<RecipientId>,
}

/// Set the local account number and resolve it as the self recipient
pub fn set_account(
    number: &str,
    config: &Config,
    storage: &Storage,
    output: &Output,
) -> Result<()> {
    let address = RecipientAddress::from_number(number).context("Invalid phone number")?;
    let resolution = storage
        .resolver
        .resolve_self_recipient_trusted(&address)
        .context("Failed to resolve own recipient")?;

    let mut config = config.clone();
    config.set_account(number)?;

    output.success(
        "set-account",
        AccountResult {
            account: config.account,
            self_recipient: Some(resolution.recipient_id),
        },
    );
    Ok(())
}

/// Show the local account and its recipient
pub fn whoami(config: &Config, storage: &Storage, output: &Output) -> Result<()> {
    output.success(
        "whoami",
        AccountResult {
            account: config.account.clone(),
            self_recipient: storage.resolver.self_recipient_id(),
        },
    );
    Ok(())
}
