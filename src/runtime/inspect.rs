//! Safe textual rendering of arbitrary JavaScript values.
//!
//! Values handed to the inspector come from untrusted code. The walk reads
//! properties through their descriptors so accessors stay uncalled, renders a
//! proxy's target instead of trapping it, and keeps a stack of the composites
//! it is currently expanding to cut cycles. Regular expressions are the
//! exception: they render through their own string conversion.
//!
//! Every V8 call that can fail is checked; a failed step falls back to
//! `String(value)` and, if that throws too, to `[Unserializable]`.

use chrono::{DateTime, SecondsFormat, Utc};
use deno_core::v8;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_DEPTH: usize = 3;
pub const DEFAULT_MAX_ITEMS: usize = 50;

const CIRCULAR: &str = "[Circular]";
const UNSERIALIZABLE: &str = "[Unserializable]";

/// Budgets for one inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectOptions {
    /// Nesting levels expanded below the top-level value.
    pub max_depth: usize,
    /// Entries shown per collection before the remainder is summarised.
    pub max_items: usize,
}

impl Default for InspectOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_items: DEFAULT_MAX_ITEMS,
        }
    }
}

impl InspectOptions {
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }
}

/// Render `value` as bounded text. Total: always returns a string.
pub fn inspect<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    options: InspectOptions,
) -> String {
    let scope = &mut v8::TryCatch::new(scope);
    let mut inspector = Inspector {
        options,
        in_progress: Vec::new(),
    };
    inspector.render(scope, value, options.max_depth)
}

/// JavaScript's own number formatting, plus `-0`.
pub fn render_number<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Option<String> {
    let number = v8::Local::<v8::Number>::try_from(value).ok()?;
    let raw = number.value();
    if raw == 0.0 && raw.is_sign_negative() {
        return Some("-0".to_string());
    }
    let text = value.to_string(scope)?;
    Some(text.to_rust_string_lossy(scope))
}

/// `String(value)`, or the last-resort literal when even that throws.
pub(crate) fn string_or_unserializable<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> String {
    let scope = &mut v8::TryCatch::new(scope);
    match value.to_string(scope) {
        Some(text) => text.to_rust_string_lossy(scope),
        None => UNSERIALIZABLE.to_string(),
    }
}

/// What an own property slot holds, read through its descriptor.
enum Slot<'s> {
    Data(v8::Local<'s, v8::Value>),
    Accessor { getter: bool, setter: bool },
    Missing,
}

impl Slot<'_> {
    fn accessor_label(getter: bool, setter: bool) -> &'static str {
        match (getter, setter) {
            (true, true) => "[Getter/Setter]",
            (true, false) => "[Getter]",
            (false, true) => "[Setter]",
            // A descriptor with neither half is still an accessor.
            (false, false) => "[Getter/Setter]",
        }
    }
}

struct Inspector<'s> {
    options: InspectOptions,
    in_progress: Vec<v8::Local<'s, v8::Object>>,
}

impl<'s> Inspector<'s> {
    fn render(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
    ) -> String {
        match self.try_render(scope, value, depth) {
            Some(text) => text,
            None => string_or_unserializable(scope, value),
        }
    }

    fn try_render(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
    ) -> Option<String> {
        if value.is_undefined() {
            return Some("undefined".to_string());
        }
        if value.is_null() {
            return Some("null".to_string());
        }
        if value.is_true() {
            return Some("true".to_string());
        }
        if value.is_false() {
            return Some("false".to_string());
        }
        if value.is_number() {
            return render_number(scope, value);
        }
        if value.is_big_int() {
            let digits = value.to_string(scope)?.to_rust_string_lossy(scope);
            return Some(format!("{digits}n"));
        }
        if value.is_string() {
            let text = value.to_rust_string_lossy(scope);
            return quote(&text);
        }
        if value.is_symbol() {
            let symbol = v8::Local::<v8::Symbol>::try_from(value).ok()?;
            let description = symbol.description(scope);
            if description.is_undefined() {
                return Some("Symbol()".to_string());
            }
            let description = description.to_rust_string_lossy(scope);
            return Some(format!("Symbol({description})"));
        }
        if value.is_proxy() {
            return self.render_proxy(scope, value, depth);
        }
        if value.is_function() {
            let function = v8::Local::<v8::Function>::try_from(value).ok()?;
            let name = function.get_name(scope).to_rust_string_lossy(scope);
            if is_class_source(scope, value) {
                return Some(format!("[class {name}]"));
            }
            if name.is_empty() {
                return Some("[Function]".to_string());
            }
            return Some(format!("[Function: {name}]"));
        }

        let object = v8::Local::<v8::Object>::try_from(value).ok()?;

        if value.is_date() {
            let date = v8::Local::<v8::Date>::try_from(value).ok()?;
            return Some(render_date(date.value_of()));
        }
        if value.is_native_error() {
            // ToDetailString reads name/message as data properties only.
            let detail = value.to_detail_string(scope)?;
            return Some(detail.to_rust_string_lossy(scope));
        }
        if value.is_reg_exp() {
            let source = value.to_string(scope)?;
            return Some(source.to_rust_string_lossy(scope));
        }

        if self
            .in_progress
            .iter()
            .any(|seen| seen.strict_equals(value))
        {
            return Some(CIRCULAR.to_string());
        }
        if depth == 0 {
            return Some(type_tag(scope, object, value));
        }

        self.in_progress.push(object);
        let rendered = if value.is_array() {
            self.render_array(scope, object, depth)
        } else if value.is_typed_array() {
            self.render_typed_array(scope, object, value, depth)
        } else if value.is_map() {
            self.render_map(scope, value, depth)
        } else if value.is_set() {
            self.render_set(scope, value, depth)
        } else {
            self.render_object(scope, object, depth)
        };
        self.in_progress.pop();
        rendered
    }

    fn render_proxy(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
    ) -> Option<String> {
        let proxy = v8::Local::<v8::Proxy>::try_from(value).ok()?;
        if proxy.is_revoked() {
            return Some("Proxy(<revoked>)".to_string());
        }
        if depth == 0 {
            return Some("[Proxy]".to_string());
        }
        let target = proxy.get_target(scope);
        let target = self.render(scope, target, depth - 1);
        Some(format!("Proxy({target})"))
    }

    fn render_array(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
        depth: usize,
    ) -> Option<String> {
        let array = v8::Local::<v8::Array>::try_from(object).ok()?;
        let length = array.length() as usize;
        let shown = length.min(self.options.max_items);

        let mut parts = Vec::with_capacity(shown + 1);
        for index in 0..shown {
            let key = v8::String::new(scope, &index.to_string())?;
            let part = match read_own(scope, object, key.into())? {
                Slot::Data(item) => self.render(scope, item, depth - 1),
                Slot::Accessor { getter, setter } => {
                    Slot::accessor_label(getter, setter).to_string()
                }
                Slot::Missing => "<empty>".to_string(),
            };
            parts.push(part);
        }
        if length > shown {
            parts.push(remainder(length - shown, "item", "items"));
        }
        Some(format!("[{}]", parts.join(", ")))
    }

    fn render_map(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
    ) -> Option<String> {
        let map = v8::Local::<v8::Map>::try_from(value).ok()?;
        let size = map.size();
        // Flat [key, value, key, value, ...] snapshot; no iterator protocol involved.
        let entries = map.as_array(scope);
        let shown = size.min(self.options.max_items);

        let mut parts = Vec::with_capacity(shown + 1);
        for index in 0..shown {
            let key = entries.get_index(scope, (index * 2) as u32)?;
            let item = entries.get_index(scope, (index * 2 + 1) as u32)?;
            let key = self.render(scope, key, depth - 1);
            let item = self.render(scope, item, depth - 1);
            parts.push(format!("{key} => {item}"));
        }
        if size > shown {
            parts.push(remainder(size - shown, "item", "items"));
        }
        Some(format!("Map({size}) {{{}}}", parts.join(", ")))
    }

    fn render_set(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
    ) -> Option<String> {
        let set = v8::Local::<v8::Set>::try_from(value).ok()?;
        let size = set.size();
        let members = set.as_array(scope);
        let shown = size.min(self.options.max_items);

        let mut parts = Vec::with_capacity(shown + 1);
        for index in 0..shown {
            let member = members.get_index(scope, index as u32)?;
            parts.push(self.render(scope, member, depth - 1));
        }
        if size > shown {
            parts.push(remainder(size - shown, "item", "items"));
        }
        Some(format!("Set({size}) {{{}}}", parts.join(", ")))
    }

    /// Elements are read by index, so huge buffers cost no more than `max_items` reads.
    fn render_typed_array(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
        value: v8::Local<'s, v8::Value>,
        depth: usize,
    ) -> Option<String> {
        let typed = v8::Local::<v8::TypedArray>::try_from(value).ok()?;
        let length = typed.length();
        let shown = length.min(self.options.max_items);

        let mut parts = Vec::with_capacity(shown + 1);
        for index in 0..shown {
            let element = object.get_index(scope, index as u32)?;
            parts.push(self.render(scope, element, depth - 1));
        }
        if length > shown {
            parts.push(remainder(length - shown, "item", "items"));
        }
        let name = class_name(scope, object).unwrap_or_else(|| "TypedArray".to_string());
        Some(format!("{name}({length}) [{}]", parts.join(", ")))
    }

    fn render_object(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        object: v8::Local<'s, v8::Object>,
        depth: usize,
    ) -> Option<String> {
        let names = object.get_own_property_names(
            scope,
            v8::GetPropertyNamesArgs {
                property_filter: v8::PropertyFilter::SKIP_SYMBOLS,
                key_conversion: v8::KeyConversionMode::ConvertToString,
                ..Default::default()
            },
        )?;
        let count = names.length() as usize;
        let shown = count.min(self.options.max_items);

        let mut parts = Vec::with_capacity(shown + 1);
        for index in 0..shown {
            let key = names.get_index(scope, index as u32)?;
            let name = key.to_rust_string_lossy(scope);
            let key = v8::Local::<v8::Name>::try_from(key).ok()?;
            let rendered = match read_own(scope, object, key)? {
                Slot::Data(item) => self.render(scope, item, depth - 1),
                Slot::Accessor { getter, setter } => {
                    Slot::accessor_label(getter, setter).to_string()
                }
                Slot::Missing => continue,
            };
            parts.push(format!("{}: {rendered}", render_key(&name)?));
        }
        if count > shown {
            parts.push(remainder(count - shown, "property", "properties"));
        }

        let body = format!("{{{}}}", parts.join(", "));
        match class_name(scope, object) {
            Some(name) => Some(format!("{name} {body}")),
            None => Some(body),
        }
    }
}

/// Look at an own property through its descriptor so accessors stay uncalled.
fn read_own<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    key: v8::Local<'s, v8::Name>,
) -> Option<Slot<'s>> {
    let descriptor = object.get_own_property_descriptor(scope, key)?;
    if descriptor.is_undefined() {
        return Some(Slot::Missing);
    }
    let descriptor = v8::Local::<v8::Object>::try_from(descriptor).ok()?;

    let value_key = v8::String::new(scope, "value")?;
    if descriptor.has_own_property(scope, value_key.into())? {
        return Some(Slot::Data(descriptor.get(scope, value_key.into())?));
    }
    let getter = has_defined_field(scope, descriptor, "get")?;
    let setter = has_defined_field(scope, descriptor, "set")?;
    Some(Slot::Accessor { getter, setter })
}

fn has_defined_field<'s>(
    scope: &mut v8::HandleScope<'s>,
    descriptor: v8::Local<'s, v8::Object>,
    field: &str,
) -> Option<bool> {
    let key = v8::String::new(scope, field)?;
    if !descriptor.has_own_property(scope, key.into())? {
        return Some(false);
    }
    let half = descriptor.get(scope, key.into())?;
    Some(!half.is_undefined())
}

/// Constructor name for instances of anything other than `Object`.
fn class_name<'s>(scope: &mut v8::HandleScope<'s>, object: v8::Local<'s, v8::Object>) -> Option<String> {
    let name = object.get_constructor_name().to_rust_string_lossy(scope);
    if name.is_empty() || name == "Object" {
        None
    } else {
        Some(name)
    }
}

/// Detail strings of functions are their source text, read without side effects.
fn is_class_source<'s>(scope: &mut v8::HandleScope<'s>, value: v8::Local<'s, v8::Value>) -> bool {
    match value.to_detail_string(scope) {
        Some(source) => opens_class_declaration(&source.to_rust_string_lossy(scope)),
        None => false,
    }
}

/// `class` must stand alone as a keyword, so `classify() {}` and
/// `classy => 1` stay plain functions.
fn opens_class_declaration(source: &str) -> bool {
    match source.strip_prefix("class") {
        Some(rest) => rest
            .chars()
            .next()
            .is_some_and(|next| next.is_whitespace() || next == '{' || next == '/'),
        None => false,
    }
}

fn type_tag<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    value: v8::Local<'s, v8::Value>,
) -> String {
    if value.is_array() {
        "[Array]".to_string()
    } else if value.is_map() {
        "[Map]".to_string()
    } else if value.is_set() {
        "[Set]".to_string()
    } else {
        let name = class_name(scope, object).unwrap_or_else(|| "Object".to_string());
        format!("[{name}]")
    }
}

fn render_date(millis: f64) -> String {
    if !millis.is_finite() {
        return "Invalid Date".to_string();
    }
    match DateTime::<Utc>::from_timestamp_millis(millis as i64) {
        Some(instant) => instant.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => "Invalid Date".to_string(),
    }
}

fn quote(text: &str) -> Option<String> {
    serde_json::to_string(text).ok()
}

fn render_key(name: &str) -> Option<String> {
    if is_identifier(name) {
        Some(name.to_string())
    } else {
        quote(name)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn remainder(count: usize, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("... 1 more {singular}")
    } else {
        format!("... {count} more {plural}")
    }
}
