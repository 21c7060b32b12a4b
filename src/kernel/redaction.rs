/// Turns raw call arguments into a summary safe to sign, score and audit.
/// Runs on the caller's thread; must be cheap.
pub trait Redactor: Send + Sync {
    fn redact(&self, raw_args: &str) -> String;
}

impl<F> Redactor for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn redact(&self, raw_args: &str) -> String {
        self(raw_args)
    }
}

/// Default redactor: masks digit runs and email-like tokens, then truncates.
///
/// `"user=alice@example.com id=4411"` becomes `"user=<email> id=<num>"`.
#[derive(Debug, Clone)]
pub struct MaskingRedactor {
    pub max_len: usize,
}

impl Default for MaskingRedactor {
    fn default() -> Self {
        Self { max_len: 256 }
    }
}

impl MaskingRedactor {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    fn mask_token(token: &str) -> String {
        // key=value pairs keep their key
        if let Some((key, value)) = token.split_once('=') {
            return format!("{}={}", key, Self::mask_token(value));
        }
        if looks_like_email(token) {
            return "<email>".to_string();
        }
        let mut out = String::with_capacity(token.len());
        let mut in_digits = false;
        for c in token.chars() {
            if c.is_ascii_digit() {
                if !in_digits {
                    out.push_str("<num>");
                    in_digits = true;
                }
            } else {
                in_digits = false;
                out.push(c);
            }
        }
        out
    }
}

fn looks_like_email(token: &str) -> bool {
    match token.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

impl Redactor for MaskingRedactor {
    fn redact(&self, raw_args: &str) -> String {
        let masked = raw_args
            .split_whitespace()
            .map(Self::mask_token)
            .collect::<Vec<_>>()
            .join(" ");
        if masked.chars().count() > self.max_len {
            let mut cut: String = masked.chars().take(self.max_len).collect();
            cut.push('…');
            cut
        } else {
            masked
        }
    }
}
