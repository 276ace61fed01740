//! Best-effort completion of model output that was cut off mid-stream.
//!
//! The scan is string-aware: brackets inside string literals are ignored and
//! escapes are honoured. After the scan an open string is closed, a dangling
//! key gets a `null` value, a trailing comma is dropped, and every open
//! container is closed innermost first.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjState {
    ExpectKey,
    AfterKey,
    ExpectValue,
    AfterValue,
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    Object(ObjState),
    Array,
}

fn mark_value_done(stack: &mut [Frame]) {
    if let Some(Frame::Object(state)) = stack.last_mut()
        && *state == ObjState::ExpectValue
    {
        *state = ObjState::AfterValue;
    }
}

pub fn repair_truncated_json(text: &str) -> String {
    let mut out = text.trim_end().to_string();
    let mut stack: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut string_is_key = false;
    let mut escaped = false;

    for ch in out.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                if string_is_key {
                    if let Some(Frame::Object(state)) = stack.last_mut() {
                        *state = ObjState::AfterKey;
                    }
                } else {
                    mark_value_done(&mut stack);
                }
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                string_is_key = matches!(stack.last(), Some(Frame::Object(ObjState::ExpectKey)));
            }
            '{' => stack.push(Frame::Object(ObjState::ExpectKey)),
            '[' => stack.push(Frame::Array),
            '}' | ']' => {
                stack.pop();
                mark_value_done(&mut stack);
            }
            ':' => {
                if let Some(Frame::Object(state)) = stack.last_mut() {
                    *state = ObjState::ExpectValue;
                }
            }
            ',' => {
                if let Some(Frame::Object(state)) = stack.last_mut() {
                    *state = ObjState::ExpectKey;
                }
            }
            c if !c.is_whitespace() => mark_value_done(&mut stack),
            _ => {}
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
        if string_is_key {
            if let Some(Frame::Object(state)) = stack.last_mut() {
                *state = ObjState::AfterKey;
            }
        } else {
            mark_value_done(&mut stack);
        }
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    match stack.last() {
        Some(Frame::Object(ObjState::AfterKey)) => out.push_str(":null"),
        Some(Frame::Object(ObjState::ExpectValue)) => out.push_str("null"),
        _ => {
            if out.ends_with(',') {
                out.pop();
            }
        }
    }

    for frame in stack.iter().rev() {
        out.push(match frame {
            Frame::Object(_) => '}',
            Frame::Array => ']',
        });
    }
    out
}

/// Strips a leading ```json fence if the model wrapped its answer in one.
pub fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}
