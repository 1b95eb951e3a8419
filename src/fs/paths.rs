use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::Fs;

/// Utility fns for making common types of paths.
/// Ids are rendered in their hyphenated form.
impl Fs {
    /// $OUTPUT/requests
    pub fn requests_dir<'a>(&self, buf: &'a mut PathBuf) -> &'a Path {
        self.parts2(&self.output_prefix, "requests", buf)
    }

    /// $OUTPUT/requests/<request>
    pub fn request_dir<'a>(&self, request: Uuid, buf: &'a mut PathBuf) -> &'a Path {
        self.parts3(&self.output_prefix, "requests", request.to_string(), buf)
    }

    /// $OUTPUT/requests/<request>/request.json
    pub fn request_json<'a>(&self, request: Uuid, buf: &'a mut PathBuf) -> &'a Path {
        self.request_dir(request, buf);
        buf.push("request.json");
        &*buf
    }

    /// $OUTPUT/requests/<request>/identity.json
    pub fn identity_json<'a>(&self, request: Uuid, buf: &'a mut PathBuf) -> &'a Path {
        self.request_dir(request, buf);
        buf.push("identity.json");
        &*buf
    }

    /// $OUTPUT/requests/<request>/execution_log.jsonl
    pub fn execution_log<'a>(&self, request: Uuid, buf: &'a mut PathBuf) -> &'a Path {
        self.request_dir(request, buf);
        buf.push("execution_log.jsonl");
        &*buf
    }

    /// $OUTPUT/requests/<request>/tasks
    pub fn tasks_dir<'a>(&self, request: Uuid, buf: &'a mut PathBuf) -> &'a Path {
        self.request_dir(request, buf);
        buf.push("tasks");
        &*buf
    }

    /// $OUTPUT/requests/<request>/tasks/<task>.json
    pub fn task_json<'a>(&self, request: Uuid, task: Uuid, buf: &'a mut PathBuf) -> &'a Path {
        self.tasks_dir(request, buf);
        buf.push(format!("{task}.json"));
        &*buf
    }

    fn parts2<'a, T, U>(&self, p1: T, p2: U, buf: &'a mut PathBuf) -> &'a Path
    where
        T: AsRef<Path>,
        U: AsRef<Path>,
    {
        buf.clear();
        buf.push(p1);
        buf.push(p2);
        &*buf
    }

    fn parts3<'a, T, U, V>(&self, p1: T, p2: U, p3: V, buf: &'a mut PathBuf) -> &'a Path
    where
        T: AsRef<Path>,
        U: AsRef<Path>,
        V: AsRef<Path>,
    {
        buf.clear();
        buf.push(p1);
        buf.push(p2);
        buf.push(p3);
        &*buf
    }
}
