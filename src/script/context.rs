//! Request context handed to script entry points.

use std::collections::HashMap;

use mlua::{UserData, UserDataMethods, Value};

/// What a script produced for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: String::new(),
        }
    }
}

impl Response {
    /// Last value set for a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn set_header(&mut self, name: String, value: String) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value));
    }
}

/// Request data plus the response being built.
///
/// Passed to the entry point as userdata and taken back after the call.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    method: String,
    path: String,
    params: HashMap<String, String>,
    response: Response,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Entry point name for a page: the lowercased HTTP method.
    pub fn entry_point(&self) -> String {
        self.method.to_lowercase()
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Append text to the response body.
    pub fn write(&mut self, text: &str) {
        self.response.body.push_str(text);
    }

    pub fn into_response(self) -> Response {
        self.response
    }
}

impl UserData for RequestContext {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("method", |_, this, ()| Ok(this.method.clone()));

        methods.add_method("path", |_, this, ()| Ok(this.path.clone()));

        methods.add_method("param", |_, this, name: String| {
            Ok(this.params.get(&name).cloned())
        });

        methods.add_method_mut("write", |_, this, text: String| {
            this.write(&text);
            Ok(())
        });

        methods.add_method_mut("setStatus", |_, this, code: u16| {
            this.response.status = code;
            Ok(())
        });

        methods.add_method_mut("setHeader", |_, this, (name, value): (String, String)| {
            this.response.set_header(name, value);
            Ok(())
        });

        methods.add_method_mut("redirect", |_, this, url: String| {
            this.response.status = 302;
            this.response.set_header("Location".to_string(), url);
            Ok(())
        });

        // ctx:json(value) - serialise a Lua value as the response body
        methods.add_method_mut("json", |_, this, value: Value| {
            let json = serde_json::to_string(&value).map_err(mlua::Error::external)?;
            this.response
                .set_header("Content-Type".to_string(), "application/json".to_string());
            this.write(&json);
            Ok(())
        });
    }
}
