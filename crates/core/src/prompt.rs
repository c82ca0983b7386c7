//! Prompt assembly.
//!
//! Turns the request payload into the token sequence a slot will prefill,
//! following the rules of each completion kind: BOS handling for plain
//! completions, fill-in-the-middle framing for infill, and the
//! query/document sandwich for rerank.

use crate::error::EngineError;
use crate::model::{ModelBackend, Token};
use crate::task::{CompletionKind, CompletionRequestData, PromptInput, PromptPart};

/// Tokenize any accepted prompt form. `add_special` only applies to the
/// leading fragment, mirroring single-string tokenization.
pub fn tokenize_input(
    backend: &dyn ModelBackend,
    input: &PromptInput,
    add_special: bool,
    parse_special: bool,
) -> Vec<Token> {
    match input {
        PromptInput::Text(text) => backend.tokenize(text, add_special, parse_special),
        PromptInput::Tokens(tokens) => tokens.clone(),
        PromptInput::Mixed(parts) => {
            let mut out = Vec::new();
            let mut first = true;
            for part in parts {
                match part {
                    PromptPart::Text(text) => {
                        out.extend(backend.tokenize(text, add_special && first, parse_special));
                    }
                    PromptPart::Tokens(tokens) => out.extend_from_slice(tokens),
                    PromptPart::Token(token) => out.push(*token),
                }
                first = false;
            }
            out
        }
    }
}

/// Build the prefill token sequence for a launched task.
///
/// `system_active` suppresses the BOS for plain prompts: the shared system
/// prefix on sequence 0 already starts the context.
pub fn assemble(
    backend: &dyn ModelBackend,
    data: &CompletionRequestData,
    system_active: bool,
    spm_infill: bool,
) -> Result<Vec<Token>, EngineError> {
    match data.kind {
        CompletionKind::Normal => {
            let add_bos = backend.add_bos() && !system_active;
            Ok(tokenize_input(backend, &data.prompt, add_bos, true))
        }
        CompletionKind::Embedding => {
            Ok(tokenize_input(backend, &data.prompt, backend.add_bos(), true))
        }
        CompletionKind::Infill => assemble_infill(backend, data, spm_infill),
        CompletionKind::Rerank => assemble_rerank(backend, &data.prompt),
    }
}

fn assemble_infill(
    backend: &dyn ModelBackend,
    data: &CompletionRequestData,
    spm_infill: bool,
) -> Result<Vec<Token>, EngineError> {
    let prefix_tokens = backend.tokenize(&data.input_prefix, false, false);

    // The tokenizer re-adds a leading space; drop the literal one.
    let suffix = data.input_suffix.strip_prefix(' ').unwrap_or(&data.input_suffix);
    let suffix_tokens = backend.tokenize(suffix, false, false);

    let fim_pre = backend.token_fim_prefix().ok_or_else(|| {
        EngineError::NotSupported("model has no fill-in-the-middle tokens".into())
    })?;
    let fim_suf = backend.token_fim_suffix().ok_or_else(|| {
        EngineError::NotSupported("model has no fill-in-the-middle tokens".into())
    })?;

    let mut prefix_part = Vec::with_capacity(prefix_tokens.len() + 2);
    prefix_part.push(fim_pre);
    prefix_part.extend(prefix_tokens);

    let mut suffix_part = Vec::with_capacity(suffix_tokens.len() + 1);
    suffix_part.push(fim_suf);
    suffix_part.extend(suffix_tokens);

    let (first, second) = if spm_infill {
        (suffix_part, prefix_part)
    } else {
        (prefix_part, suffix_part)
    };

    let mut out = Vec::with_capacity(first.len() + second.len() + 2);
    if backend.add_bos() {
        out.push(backend.token_bos());
    }
    out.extend(first);
    out.extend(second);
    if let Some(fim_mid) = backend.token_fim_middle() {
        out.push(fim_mid);
    }
    Ok(out)
}

/// Rerank prompts arrive as the two-element array `[query, document]` and
/// become `[BOS] query [EOS] [SEP] doc [EOS]`.
fn assemble_rerank(
    backend: &dyn ModelBackend,
    prompt: &PromptInput,
) -> Result<Vec<Token>, EngineError> {
    let (query, doc) = match prompt {
        PromptInput::Mixed(parts) if parts.len() == 2 => {
            match (&parts[0], &parts[1]) {
                (PromptPart::Text(query), PromptPart::Text(doc)) => (query, doc),
                _ => {
                    return Err(EngineError::InvalidRequest(
                        "rerank prompt must be a [query, document] pair of strings".into(),
                    ))
                }
            }
        }
        _ => {
            return Err(EngineError::InvalidRequest(
                "rerank prompt must be a [query, document] pair of strings".into(),
            ))
        }
    };

    let mut out = vec![backend.token_bos()];
    out.extend(backend.tokenize(query, false, false));
    out.push(backend.token_eos());
    out.push(backend.token_sep());
    out.extend(backend.tokenize(doc, false, false));
    out.push(backend.token_eos());
    Ok(out)
}
