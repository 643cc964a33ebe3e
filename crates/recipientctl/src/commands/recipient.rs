use anyhow::{Context, Result};
use clap::Args;
use recipients::{Aci, Pni, RecipientAddress, RecipientId, RecipientWithAddress};
use serde::Serialize;

use crate::output::Output;
use crate::storage::Storage;

/// Identifiers of one peer, any subset of them
#[derive(Args, Debug, Clone, Default)]
pub struct AddressArgs {
    /// Account identity (UUID)
    #[arg(long)]
    pub aci: Option<String>,

    /// Phone number identity (UUID, optionally prefixed with "PNI:")
    #[arg(long)]
    pub pni: Option<String>,

    /// Phone number in E.164 format
    #[arg(long)]
    pub number: Option<String>,

    /// Username
    #[arg(long)]
    pub username: Option<String>,
}

impl AddressArgs {
    pub fn to_address(&self) -> Result<RecipientAddress> {
        let aci = self
            .aci
            .as_deref()
            .map(str::parse::<Aci>)
            .transpose()
            .context("Invalid ACI")?;
        let pni = self
            .pni
            .as_deref()
            .map(str::parse::<Pni>)
            .transpose()
            .context("Invalid PNI")?;
        RecipientAddress::new(aci, pni, self.number.clone(), self.username.clone())
            .context("Give at least one of --aci, --pni, --number, --username")
    }
}

#[derive(Serialize)]
struct RecipientInfo {
    id: RecipientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    aci: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pni: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
}

impl From<RecipientWithAddress> for RecipientInfo {
    fn from(recipient: RecipientWithAddress) -> Self {
        let address = recipient.address;
        Self {
            id: recipient.id,
            aci: address.aci().map(|aci| aci.to_string()),
            pni: address.pni().map(|pni| pni.to_string()),
            number: address.number().map(str::to_string),
            username: address.username().map(str::to_string),
        }
    }
}

#[derive(Serialize)]
struct ResolveResult {
    recipient: RecipientInfo,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    merged: Vec<RecipientId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cascade_failures: Vec<String>,
}

#[derive(Serialize)]
struct ListResult {
    recipients: Vec<RecipientInfo>,
}

fn info(storage: &Storage, id: RecipientId) -> Result<RecipientInfo> {
    storage
        .resolver
        .get(id)
        .map(RecipientInfo::from)
        .with_context(|| format!("Recipient {} not found", id))
}

/// Resolve identifiers known to belong together, merging recipients if needed
pub fn resolve(args: &AddressArgs, storage: &Storage, output: &Output) -> Result<()> {
    let address = args.to_address()?;
    let resolution = storage
        .resolver
        .resolve_recipient_trusted(&address)
        .context("Failed to resolve recipient")?;

    let result = ResolveResult {
        recipient: info(storage, resolution.recipient_id)?,
        merged: resolution.merged,
        cascade_failures: resolution
            .cascade_failures
            .iter()
            .map(|failure| format!("{}: {}", failure.store, failure.message))
            .collect(),
    };
    output.success("resolve", result);
    Ok(())
}

/// Find the recipient for identifiers that are not known to belong together
pub fn lookup(args: &AddressArgs, storage: &Storage, output: &Output) -> Result<()> {
    let address = args.to_address()?;
    let id = storage
        .resolver
        .resolve_recipient(&address)
        .context("Failed to look up recipient")?;
    output.success("lookup", info(storage, id)?);
    Ok(())
}

/// Show one recipient; ids absorbed by a merge show the surviving recipient
pub fn show(id: &str, storage: &Storage, output: &Output) -> Result<()> {
    let id: RecipientId = id.parse().context("Invalid recipient id")?;
    output.success("show", info(storage, id)?);
    Ok(())
}

pub fn list(storage: &Storage, output: &Output) -> Result<()> {
    let recipients = storage
        .resolver
        .all()
        .into_iter()
        .map(RecipientInfo::from)
        .collect();
    output.success("list", ListResult { recipients });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(number: Option<&str>, aci: Option<&str>) -> AddressArgs {
        AddressArgs {
            number: number.map(str::to_string),
            aci: aci.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_args_are_rejected() {
        assert!(AddressArgs::default().to_address().is_err());
    }

    #[test]
    fn test_invalid_aci_is_rejected() {
        assert!(args(None, Some("not-a-uuid")).to_address().is_err());
    }

    #[test]
    fn test_resolve_then_show_merged_id() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(temp.path()).unwrap();
        let output = Output::new(true);
        let aci = "5c1a0e4e-8a0b-4e53-9e0e-5bd4b6f0a001";

        resolve(&args(Some("+4915550300"), None), &storage, &output).unwrap();
        resolve(&args(None, Some(aci)), &storage, &output).unwrap();
        resolve(&args(Some("+4915550300"), Some(aci)), &storage, &output).unwrap();

        let all = storage.resolver.all();
        assert_eq!(all.len(), 1);
        let first = RecipientId::new(1);
        let shown = info(&storage, first).unwrap();
        assert_eq!(shown.id, all[0].id);
        assert_eq!(shown.number.as_deref(), Some("+4915550300"));
        assert!(show("1", &storage, &output).is_ok());
        assert!(show("99", &storage, &output).is_err());
    }
}
