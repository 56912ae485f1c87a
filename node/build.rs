fn main() {
    // ESP-IDF link args are only needed for the on-device build.
    if std::env::var_os("CARGO_FEATURE_ESP32").is_some() {
        embuild::espidf::sysenv::output();
    }
}
