//! Trust on first use for server fingerprints.

use anyhow::{Result, bail};
use dialoguer::Select;

use imux_services::known_hosts::{HostStatus, KnownHosts};

/// Decide whether to go on talking to `addr`, which presented `fingerprint`.
///
/// Unknown hosts are offered to the user; `assume_yes` saves them without
/// asking. A changed fingerprint always needs an explicit answer.
pub fn verify_host(
    known: &mut KnownHosts,
    addr: &str,
    fingerprint: &str,
    assume_yes: bool,
) -> Result<()> {
    match known.check(addr, fingerprint) {
        HostStatus::Known => {
            tracing::debug!(addr, "host fingerprint matches known hosts");
            Ok(())
        }
        HostStatus::Unknown => {
            eprintln!("The authenticity of host {addr} can't be established.");
            eprintln!("Fingerprint: {fingerprint}");
            if assume_yes {
                known.save(addr, fingerprint)?;
                return Ok(());
            }
            let items = &["Abort", "Continue once", "Save and continue"];
            let choice = Select::new()
                .with_prompt("Trust this host?")
                .items(items)
                .default(0)
                .interact()?;
            match choice {
                1 => Ok(()),
                2 => {
                    known.save(addr, fingerprint)?;
                    Ok(())
                }
                _ => bail!("host {addr} not trusted"),
            }
        }
        HostStatus::Mismatch { stored } => {
            eprintln!("WARNING: the fingerprint of {addr} has changed!");
            eprintln!("  known   : {stored}");
            eprintln!("  offered : {fingerprint}");
            eprintln!("Someone could be intercepting this connection.");
            if assume_yes {
                bail!("fingerprint mismatch for {addr}");
            }
            let items = &["Abort", "Continue once", "Update known hosts and continue"];
            let choice = Select::new()
                .with_prompt("Continue anyway?")
                .items(items)
                .default(0)
                .interact()?;
            match choice {
                1 => Ok(()),
                2 => {
                    known.save(addr, fingerprint)?;
                    Ok(())
                }
                _ => bail!("fingerprint mismatch for {addr}"),
            }
        }
    }
}
