use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::hex;

#[derive(Args)]
pub struct HexArgs {
    #[command(subcommand)]
    pub command: HexCommands,
}

#[derive(Subcommand)]
pub enum HexCommands {
    /// Parse hex text and print the normalized listing
    Decode {
        /// Hex text; separators and non-hex characters are ignored
        text: String,

        /// Write the raw bytes to this file instead
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print a file's bytes as a hex listing
    Encode {
        file: PathBuf,
    },
}

pub async fn run(args: HexArgs) -> Result<()> {
    match args.command {
        HexCommands::Decode { text, output } => decode(&text, output),
        HexCommands::Encode { file } => encode(&file),
    }
}

fn decode(text: &str, output: Option<PathBuf>) -> Result<()> {
    let bytes = hex::decode(text)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => {
            println!("{}", hex::encode(&bytes).trim_end());
            eprintln!("{} bytes", bytes.len());
        }
    }

    Ok(())
}

fn encode(file: &Path) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    println!("{}", hex::encode(&bytes).trim_end());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decode_writes_raw_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("code.bin");

        run(HexArgs {
            command: HexCommands::Decode {
                text: "B8 2A 00 00 00 C3".into(),
                output: Some(out.clone()),
            },
        })
        .await
        .unwrap();

        assert_eq!(
            std::fs::read(&out).unwrap(),
            vec![0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]
        );
    }

    #[tokio::test]
    async fn decode_rejects_malformed_text() {
        let result = run(HexArgs {
            command: HexCommands::Decode {
                text: "B8 2".into(),
                output: None,
            },
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("hex parse failed"));
    }

    #[tokio::test]
    async fn encode_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let result = run(HexArgs {
            command: HexCommands::Encode {
                file: tmp.path().join("missing.bin"),
            },
        })
        .await;
        assert!(result.is_err());
    }
}
