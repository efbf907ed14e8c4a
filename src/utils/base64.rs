use base64::{engine::general_purpose, Engine as _};

/// Encodes a string to Base64 format.
pub fn base64_encode(input: &str) -> String {
    general_purpose::STANDARD.encode(input)
}

/// Decodes a Base64 string to its original form.
///
/// Padding stripped by share-link emitters is restored before decoding.
/// Returns an empty string if the input is invalid.
pub fn base64_decode(input: &str, accept_urlsafe: bool) -> String {
    let padded = repad(input);
    let engine = if accept_urlsafe {
        general_purpose::URL_SAFE
    } else {
        general_purpose::STANDARD
    };

    match engine.decode(padded.as_str()) {
        Ok(decoded) => String::from_utf8_lossy(&decoded).to_string(),
        Err(_) => String::new(),
    }
}

/// Decodes a URL-safe Base64 string to its original form.
pub fn url_safe_base64_decode(input: &str) -> String {
    base64_decode(&input.replace('-', "+").replace('_', "/"), false)
}

/// Restores the `=` padding many subscription providers strip.
fn repad(input: &str) -> String {
    let rem = input.len() % 4;
    if rem == 0 {
        input.to_string()
    } else {
        let mut s = input.to_string();
        for _ in 0..(4 - rem) {
            s.push('=');
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_handles_missing_padding() {
        // "ab" encodes to "YWI=" - strip the padding and decode anyway
        assert_eq!(base64_decode("YWI", false), "ab");
        assert_eq!(base64_decode("YWI=", false), "ab");
    }

    #[test]
    fn url_safe_variant_decodes() {
        let encoded = general_purpose::URL_SAFE_NO_PAD.encode("chacha20:secret");
        assert_eq!(url_safe_base64_decode(&encoded), "chacha20:secret");
    }

    #[test]
    fn invalid_input_yields_empty() {
        assert_eq!(base64_decode("!!not base64!!", false), "");
    }
}
