use std::io::Write;

use p11probe_core::{
    cipher::{AlgorithmParams, Cipher, Direction},
    config::SlotSelector,
    driver::{DEFAULT_ALIAS, DEFAULT_PIN},
    run, run_loaded, KeyStore, Outcome, Pin, Pkcs11Provider, ProbeError, ProbeSettings, Provider,
    ProviderConfig, SoftProvider,
};

#[test]
fn full_probe_against_software_provider() {
    let provider = SoftProvider::new(Pin::from(DEFAULT_PIN));
    let mut out = Vec::new();
    let outcome = run(&provider, &ProbeSettings::default(), &mut out).unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let report = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = report.lines().collect();
    let block_start = lines
        .iter()
        .position(|line| *line == "Testing AES block ciphers")
        .unwrap();
    assert_eq!(lines[block_start + 1], "- AES/CBC/NoPadding");
    assert_eq!(lines[block_start + 2], "  - cipher   : AES/CBC/NoPadding");
    assert_eq!(lines[block_start + 3], "  - blockSize: 16");
    assert!(lines[block_start + 4].starts_with("  - IV       : "));

    let keystore = KeyStore::load(&provider, &Pin::from(DEFAULT_PIN)).unwrap();
    assert_eq!(keystore.aliases().unwrap(), vec![DEFAULT_ALIAS.to_string()]);
}

#[test]
fn stored_key_decrypts_what_the_session_key_encrypted() {
    let provider = SoftProvider::new(Pin::from("1234"));
    let pin = Pin::from("1234");
    let keystore = KeyStore::load(&provider, &pin).unwrap();
    let session_key = provider.generate_secret_key(256).unwrap();
    keystore.set_key_entry("k", &session_key, &pin).unwrap();
    let stored = keystore.get_key("k", &pin).unwrap().unwrap();

    let mut enc = Cipher::get_instance(&provider, "AES/CBC/PKCS5Padding").unwrap();
    enc.init(Direction::Encrypt, &session_key, None).unwrap();
    let iv = enc.iv().unwrap().to_vec();
    let ct = enc.do_final(b"seventeen bytes!!").unwrap();
    assert_eq!(ct.len(), 32);

    let mut dec = Cipher::get_instance(&provider, "AES/CBC/PKCS5Padding").unwrap();
    dec.init(Direction::Decrypt, &stored, Some(AlgorithmParams::Iv(&iv)))
        .unwrap();
    assert_eq!(dec.do_final(&ct).unwrap(), b"seventeen bytes!!");
}

#[test]
fn missing_configuration_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Pkcs11Provider::from_config_file(&dir.path().join("pkcs11.cfg"))
        .err()
        .unwrap();
    assert!(matches!(err, ProbeError::Config(_)));

    let mut out = Vec::new();
    let outcome = run_loaded(
        Pkcs11Provider::from_config_file(&dir.path().join("pkcs11.cfg")),
        &ProbeSettings::default(),
        &mut out,
    )
    .unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert!(out.is_empty());
}

#[test]
fn unloadable_library_is_a_load_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "name = missing").unwrap();
    writeln!(file, "library = /nonexistent/libmissing-pkcs11.so").unwrap();
    writeln!(file, "slotListIndex = 1").unwrap();

    let config = ProviderConfig::load(file.path()).unwrap();
    assert_eq!(config.slot, SlotSelector::ListIndex(1));
    let err = Pkcs11Provider::configure(config).err().unwrap();
    assert!(matches!(err, ProbeError::Load { .. }), "{err}");
    assert!(err.to_string().contains("libmissing-pkcs11.so"));
}
