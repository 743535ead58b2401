#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary YAML must never panic the config parser or the validator
    if let Ok(text) = std::str::from_utf8(data)
        && let Ok(config) = serde_yaml::from_str::<talos::config::Config>(text)
    {
        let _ = config.validate();
    }
});
