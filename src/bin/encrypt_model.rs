//! Model encryptor
//!
//! Encrypts a model file under the DEK released by the key broker, producing
//! the `nonce || ciphertext || tag` file the workload decrypts.
//!
//! Usage:
//!   encrypt-model model.txt private.pem wrapped-key.b64 --output model.enc

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use std::path::{Path, PathBuf};
use tdx_model_workload::keypair::parse_private_key_pem;
use tdx_model_workload::sealed;
use tdx_model_workload::unwrap::{unwrap_symmetric_key_once, OaepDigest};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(name = "encrypt-model", about = "Encrypt a model with a broker-wrapped key")]
struct Args {
    /// Plaintext model file
    data_file: PathBuf,

    /// PEM private key the wrapped key was wrapped to
    private_key_file: PathBuf,

    /// Base64 RSA-OAEP wrapped key, as released by the key broker
    wrapped_key_file: PathBuf,

    #[arg(long, short, default_value = "model.enc")]
    output: PathBuf,

    /// OAEP digest the broker wrapped with
    #[arg(long, default_value = "sha384")]
    digest: OaepDigest,
}

fn read_wrapped_key(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let encoded = std::fs::read_to_string(path)
        .with_context(|| format!("Error reading wrapped key file {}", path.display()))?;
    let wrapped = BASE64
        .decode(encoded.trim())
        .context("Error decoding the wrapped key")?;
    Ok(Zeroizing::new(wrapped))
}

fn encrypt(args: &Args) -> Result<()> {
    let model = std::fs::read(&args.data_file)
        .with_context(|| format!("Error reading the data file {}", args.data_file.display()))?;
    let mut wrapped = read_wrapped_key(&args.wrapped_key_file)?;

    let pem = Zeroizing::new(
        std::fs::read_to_string(&args.private_key_file)
            .context("Error reading private key file")?,
    );
    let private_key = parse_private_key_pem(&pem)?;

    let key = unwrap_symmetric_key_once(&mut wrapped, private_key, args.digest)
        .context("Error while unwrapping the key")?;
    info!("Successfully unwrapped key");

    let sealed = sealed::seal(&key, model).context("Data encryption failed")?;
    write_owner_only(&args.output, &sealed)?;

    info!(output = %args.output.display(), "Successfully encrypted data");
    Ok(())
}

fn write_owner_only(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("Error opening {}", path.display()))?;
    file.write_all(data)
        .context("Error during writing the encrypted data to file")?;
    Ok(())
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    encrypt(&args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use rsa::{Oaep, RsaPrivateKey};
    use sha2::Sha384;

    #[test]
    fn test_encrypt_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let dek = [0x33u8; 32];

        let wrapped = private_key
            .to_public_key()
            .encrypt(&mut OsRng, Oaep::new::<Sha384>(), &dek)
            .unwrap();

        let args = Args {
            data_file: dir.path().join("model.txt"),
            private_key_file: dir.path().join("private.pem"),
            wrapped_key_file: dir.path().join("wrapped.b64"),
            output: dir.path().join("model.enc"),
            digest: OaepDigest::Sha384,
        };
        std::fs::write(&args.data_file, b"0.1 0.2 0.3 0.4 0.5 0.6 0.7 0.8 1.0 ").unwrap();
        std::fs::write(
            &args.private_key_file,
            private_key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes(),
        )
        .unwrap();
        std::fs::write(&args.wrapped_key_file, format!("{}\n", BASE64.encode(&wrapped))).unwrap();

        encrypt(&args).unwrap();

        let encrypted = std::fs::read(&args.output).unwrap();
        let plaintext = sealed::open(&mut dek.to_vec(), &encrypted).unwrap();
        assert_eq!(plaintext.as_slice(), b"0.1 0.2 0.3 0.4 0.5 0.6 0.7 0.8 1.0 ");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&args.output).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_wrong_digest_fails() {
        let dir = tempfile::tempdir().unwrap();
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let wrapped = private_key
            .to_public_key()
            .encrypt(&mut OsRng, Oaep::new::<Sha384>(), &[1u8; 16])
            .unwrap();

        let args = Args {
            data_file: dir.path().join("model.txt"),
            private_key_file: dir.path().join("private.pem"),
            wrapped_key_file: dir.path().join("wrapped.b64"),
            output: dir.path().join("model.enc"),
            digest: OaepDigest::Sha256,
        };
        std::fs::write(&args.data_file, b"model").unwrap();
        std::fs::write(
            &args.private_key_file,
            private_key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes(),
        )
        .unwrap();
        std::fs::write(&args.wrapped_key_file, BASE64.encode(&wrapped)).unwrap();

        assert!(encrypt(&args).is_err());
        assert!(!args.output.exists());
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["encrypt-model", "m", "k.pem", "w.b64"]).unwrap();
        assert_eq!(args.digest, OaepDigest::Sha384);
        assert_eq!(args.output, PathBuf::from("model.enc"));

        let args =
            Args::try_parse_from(["encrypt-model", "m", "k", "w", "--digest", "sha256"]).unwrap();
        assert_eq!(args.digest, OaepDigest::Sha256);
    }
}
