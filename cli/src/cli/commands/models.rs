use anyhow::anyhow;

use modelgate_core::catalog::{self, Protocol};

pub fn run(protocol: Option<String>) -> anyhow::Result<()> {
    let protocol = protocol
        .map(|p| p.parse::<Protocol>().map_err(|e| anyhow!(e)))
        .transpose()?;

    for entry in catalog::MODEL_CATALOG {
        if protocol.is_some_and(|p| !entry.supports(p)) {
            continue;
        }
        let protocols: Vec<&str> = entry
            .supported_protocols
            .iter()
            .map(Protocol::as_str)
            .collect();
        println!(
            "{:<32} {:<28} [{}]",
            entry.id,
            entry.display_name,
            protocols.join(", ")
        );
    }
    Ok(())
}
