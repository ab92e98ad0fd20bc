use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::debug;
use tracing_subscriber::{fmt, EnvFilter};
use xlcrypt_cfb::{CompoundDocument, EntryType};
use xlcrypt_offcrypto::{
    decrypt_xlsx_with_options, encrypt_xlsx, parse_encrypted_package, parse_encryption_info,
    DecryptOptions, EncryptOptions, EncryptionInfo, EncryptionScheme, HashAlgorithm,
    ENCRYPTED_PACKAGE_STREAM, ENCRYPTION_INFO_STREAM,
};

#[derive(Debug, Parser)]
#[command(name = "xlcrypt")]
#[command(about = "Encrypt, decrypt and inspect password-protected OOXML workbooks.")]
struct Cli {
    /// Increase log verbosity (`-v` debug, `-vv` trace). Overrides `RUST_LOG`.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decrypt an encrypted workbook to its plain ZIP package.
    Decrypt(DecryptArgs),
    /// Encrypt a plain ZIP package into a password-protected compound file.
    Encrypt(EncryptArgs),
    /// Print the encryption parameters of an encrypted workbook.
    Inspect {
        input: PathBuf,
    },
    /// List the storages and streams of a compound file.
    Ls {
        input: PathBuf,
    },
}

#[derive(Debug, Args)]
struct PasswordArgs {
    /// Workbook password.
    #[arg(long, env = "XLCRYPT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Read the password from a file (first line, trailing newline trimmed).
    #[arg(long, value_name = "PATH")]
    password_file: Option<PathBuf>,
}

impl PasswordArgs {
    fn resolve(&self) -> Result<String> {
        if let Some(path) = &self.password_file {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read password file {}", path.display()))?;
            return Ok(contents.lines().next().unwrap_or_default().to_string());
        }
        match &self.password {
            Some(password) => Ok(password.clone()),
            None => {
                bail!("a password is required (--password, --password-file or XLCRYPT_PASSWORD)")
            }
        }
    }
}

#[derive(Debug, Args)]
struct DecryptArgs {
    input: PathBuf,
    output: PathBuf,

    #[command(flatten)]
    password: PasswordArgs,

    /// Skip the password verifier and integrity checks; a wrong password yields garbage.
    #[arg(long)]
    no_verify: bool,
}

#[derive(Debug, Args)]
struct EncryptArgs {
    input: PathBuf,
    output: PathBuf,

    #[command(flatten)]
    password: PasswordArgs,

    /// Use ECMA-376 Standard encryption instead of Agile.
    #[arg(long)]
    standard: bool,

    #[arg(long, default_value_t = 256)]
    key_bits: u32,

    /// Agile hash algorithm.
    #[arg(long, value_enum, default_value_t = HashArg::Sha512)]
    hash: HashArg,

    /// Agile password hash iterations.
    #[arg(long, default_value_t = 100_000)]
    spin_count: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HashArg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl From<HashArg> for HashAlgorithm {
    fn from(value: HashArg) -> Self {
        match value {
            HashArg::Sha1 => HashAlgorithm::Sha1,
            HashArg::Sha256 => HashAlgorithm::Sha256,
            HashArg::Sha384 => HashAlgorithm::Sha384,
            HashArg::Sha512 => HashAlgorithm::Sha512,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Decrypt(args) => decrypt(args),
        Command::Encrypt(args) => encrypt(args),
        Command::Inspect { input } => inspect(&input),
        Command::Ls { input } => list(&input),
    }
}

fn init_logging(verbose: u8) {
    fmt()
        .with_env_filter(log_filter(verbose))
        .with_writer(std::io::stderr)
        .init();
}

fn log_filter(verbose: u8) -> EnvFilter {
    match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    }
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("read {}", path.display()))
}

fn decrypt(args: DecryptArgs) -> Result<()> {
    let password = args.password.resolve()?;
    let bytes = read_input(&args.input)?;
    let options = DecryptOptions {
        verify_password: !args.no_verify,
        verify_integrity: !args.no_verify,
        ..DecryptOptions::default()
    };
    let plaintext = decrypt_xlsx_with_options(&bytes, &password, &options)
        .with_context(|| format!("decrypt {}", args.input.display()))?;
    fs::write(&args.output, &plaintext)
        .with_context(|| format!("write {}", args.output.display()))?;
    debug!("decrypted {} into {} bytes", args.input.display(), plaintext.len());
    Ok(())
}

fn encrypt(args: EncryptArgs) -> Result<()> {
    let password = args.password.resolve()?;
    let bytes = read_input(&args.input)?;
    if !bytes.starts_with(b"PK\x03\x04") {
        bail!("{} is not a ZIP package", args.input.display());
    }
    let options = EncryptOptions {
        scheme: if args.standard {
            EncryptionScheme::Standard
        } else {
            EncryptionScheme::Agile
        },
        key_bits: args.key_bits,
        hash_algorithm: args.hash.into(),
        spin_count: args.spin_count,
    };
    let container = encrypt_xlsx(&bytes, &password, &options)
        .with_context(|| format!("encrypt {}", args.input.display()))?;
    fs::write(&args.output, &container)
        .with_context(|| format!("write {}", args.output.display()))?;
    Ok(())
}

fn inspect(input: &Path) -> Result<()> {
    let doc = CompoundDocument::open(read_input(input)?)
        .with_context(|| format!("open compound file {}", input.display()))?;
    let info_bytes = doc.open_read_stream(ENCRYPTION_INFO_STREAM)?;
    let info = parse_encryption_info(&info_bytes).context("parse EncryptionInfo")?;
    let package = doc.open_read_stream(ENCRYPTED_PACKAGE_STREAM)?;
    let (declared, ciphertext) = parse_encrypted_package(&package)?;

    let version = info.version();
    match &info {
        EncryptionInfo::Standard { info, .. } => {
            println!(
                "scheme:      standard {}.{} (flags {:#x})",
                version.major, version.minor, version.flags
            );
            println!(
                "cipher:      AES-{} ECB (algID {:#06x})",
                info.header.key_bits, info.header.alg_id
            );
            println!("hash:        SHA1");
            println!("provider:    {}", info.header.csp_name);
            println!("salt:        {} bytes", info.verifier.salt.len());
        }
        EncryptionInfo::Agile { info, .. } => {
            let ke = &info.key_encryptor;
            println!("scheme:      agile {}.{}", version.major, version.minor);
            println!(
                "cipher:      {}-{} {}",
                info.key_data.cipher_algorithm,
                info.key_data.key_bits,
                info.key_data.cipher_chaining
            );
            println!("hash:        {}", info.key_data.hash_algorithm.as_offcrypto_name());
            println!(
                "password:    {} x{} ({}-bit key)",
                ke.params.hash_algorithm.as_offcrypto_name(),
                ke.spin_count,
                ke.params.key_bits
            );
            println!(
                "integrity:   {}",
                if info.data_integrity.is_some() { "HMAC" } else { "none" }
            );
        }
    }
    println!("package:     {declared} bytes ({} ciphertext)", ciphertext.len());
    Ok(())
}

fn list(input: &Path) -> Result<()> {
    let doc = CompoundDocument::open(read_input(input)?)
        .with_context(|| format!("open compound file {}", input.display()))?;
    for (path, entry) in doc.entries() {
        let kind = match entry.entry_type {
            EntryType::RootStorage => "root",
            EntryType::UserStorage => "storage",
            EntryType::UserStream => "stream",
            EntryType::LockBytes => "lockbytes",
            EntryType::Property => "property",
            EntryType::Empty => "empty",
        };
        println!("{kind:<9} {:>8} {:>12}  {path}", entry.start.to_string(), entry.size);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn verbosity_overrides_the_log_filter() {
        for (verbose, level) in [(1, "debug"), (2, "trace"), (5, "trace")] {
            let filter = log_filter(verbose).to_string();
            assert!(filter.eq_ignore_ascii_case(level), "{verbose}: {filter}");
        }

        let cli = Cli::try_parse_from(["xlcrypt", "-vv", "ls", "in.xlsx"]).expect("parse");
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn encrypt_flags_map_onto_options() {
        let cli = Cli::try_parse_from([
            "xlcrypt",
            "encrypt",
            "in.xlsx",
            "out.xlsx",
            "--password",
            "pw",
            "--standard",
            "--key-bits",
            "128",
            "--hash",
            "sha1",
        ])
        .expect("parse");
        let Command::Encrypt(args) = cli.command else {
            panic!("expected encrypt");
        };
        assert!(args.standard);
        assert_eq!(args.key_bits, 128);
        assert_eq!(HashAlgorithm::from(args.hash), HashAlgorithm::Sha1);
        assert_eq!(args.password.resolve().expect("password"), "pw");
    }
}
