// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Argument screening and output sanitization for spawned commands.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

static INJECTION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[;&|`<>\r\n\x00]|\$\(|\$\{").ok());

static MARKUP_BLOCKS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|iframe|object|embed)\b[^>]*>.*?</(script|style|iframe|object|embed)\s*>")
        .ok()
});

static OPEN_DANGEROUS_TAG: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)</?(script|style|iframe|object|embed)\b[^>]*>").ok());

static EVENT_HANDLER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?i)(<[^>]*?)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).ok()
});

static JS_URI: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)javascript\s*:").ok());

/// Screens a single argv entry for shell metacharacters.
///
/// Commands run without a shell, so these are defense in depth: an argument
/// carrying `;`, `&`, `|`, backticks, `$(`, `${`, redirects, a newline or a
/// NUL byte is refused outright.
pub fn contains_injection(arg: &str) -> bool {
    match INJECTION.as_ref() {
        Some(re) => re.is_match(arg),
        // Fail closed if the pattern could not be built.
        None => true,
    }
}

pub struct OutputSanitizer;

impl OutputSanitizer {
    /// Strips markup that would execute if the text were rendered as HTML:
    /// script/style/iframe/object/embed blocks, `javascript:` URIs and inline
    /// `on*=` handlers.
    pub fn sanitize(input: &str) -> String {
        let mut out: Cow<'_, str> = Cow::Borrowed(input);
        if let Some(re) = MARKUP_BLOCKS.as_ref() {
            out = Cow::Owned(re.replace_all(&out, "").into_owned());
        }
        if let Some(re) = OPEN_DANGEROUS_TAG.as_ref() {
            out = Cow::Owned(re.replace_all(&out, "").into_owned());
        }
        if let Some(re) = EVENT_HANDLER.as_ref() {
            // Repeat until stable: one tag may carry several handlers.
            loop {
                let next = re.replace_all(&out, "$1").into_owned();
                if next == out {
                    break;
                }
                out = Cow::Owned(next);
            }
        }
        if let Some(re) = JS_URI.as_ref() {
            out = Cow::Owned(re.replace_all(&out, "").into_owned());
        }
        out.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injection_patterns() {
        for bad in ["a;b", "a && b", "x|y", "`id`", "$(id)", "${HOME}", "a>b", "a<b", "a\nb", "a\0b"] {
            assert!(contains_injection(bad), "{:?} should be refused", bad);
        }
        for ok in ["-la", "src/main.rs", "--format=%H", "hello world", "$HOME"] {
            assert!(!contains_injection(ok), "{:?} should be allowed", ok);
        }
    }

    #[test]
    fn test_sanitize_strips_blocks_and_handlers() {
        let dirty = "<p onclick=\"steal()\" class=x>hi</p><script>alert(1)</script>\
                     <a href=\"javascript:alert(1)\">x</a><STYLE>body{}</STYLE>";
        let clean = OutputSanitizer::sanitize(dirty);
        assert!(!clean.contains("alert(1)</script>"));
        assert!(!clean.to_lowercase().contains("<script"));
        assert!(!clean.contains("onclick"));
        assert!(!clean.to_lowercase().contains("javascript:"));
        assert!(!clean.to_lowercase().contains("<style"));
        assert!(clean.contains("hi"));
    }

    #[test]
    fn test_plain_text_untouched() {
        let text = "total 8\n-rw-r--r-- 1 user user 42 main.rs\n";
        assert_eq!(OutputSanitizer::sanitize(text), text);
    }
}
