// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT


use anyhow::Result;
use git2::{BranchType, Repository, RepositoryInitOptions};
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
};

pub(crate) struct RepoFixture {
    repo: Repository,
}

impl RepoFixture {
    pub(crate) fn new(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path.as_ref(), &opts)?;

        // INVARIANT: Always provide valid name and email.
        //   - Git will complain if this is not set in CI/CD environments.
        let mut config = repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(Self { repo })
    }

    pub(crate) fn path(&self) -> Result<PathBuf> {
        let workdir = self
            .repo
            .workdir()
            .ok_or_else(|| anyhow::anyhow!("fixture repository has no work tree"))?;

        Ok(workdir.canonicalize()?)
    }

    /// Write file into work tree without committing it.
    pub(crate) fn write(&self, filename: impl AsRef<Path>, contents: impl AsRef<str>) -> Result<()> {
        write(self.path()?.join(filename), contents.as_ref())?;
        Ok(())
    }

    pub(crate) fn read(&self, filename: impl AsRef<Path>) -> Result<String> {
        Ok(read_to_string(self.path()?.join(filename))?)
    }

    pub(crate) fn write_and_commit(
        &self,
        filename: impl AsRef<Path>,
        contents: impl AsRef<str>,
    ) -> Result<()> {
        self.write(filename.as_ref(), contents)?;

        // INVARIANT: Always use new tree produced by index after staging new entry.
        let mut index = self.repo.index()?;
        index.add_path(filename.as_ref())?;
        index.write()?;
        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;

        // INVARIANT: Always determine latest parent commits to append to.
        let signature = self.repo.signature()?;
        let mut parents = Vec::new();
        if let Some(parent) = self.repo.head().ok().and_then(|head| head.target()) {
            parents.push(self.repo.find_commit(parent)?);
        }
        let parents = parents.iter().collect::<Vec<_>>();

        // INVARIANT: Commit to HEAD by appending to obtained parent commits.
        self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            format!("chore: add {:?}", filename.as_ref()).as_ref(),
            &tree,
            &parents,
        )?;

        Ok(())
    }

    /// Create branch at current HEAD without checking it out.
    pub(crate) fn branch(&self, name: &str) -> Result<()> {
        let head = self.repo.head()?.peel_to_commit()?;
        self.repo.branch(name, &head, false)?;
        Ok(())
    }

    pub(crate) fn current_branch(&self) -> Result<String> {
        let head = self.repo.head()?;
        Ok(head.shorthand().unwrap_or_default().to_string())
    }

    pub(crate) fn has_branch(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    pub(crate) fn stash_messages(&mut self) -> Result<Vec<String>> {
        let mut messages = Vec::new();
        self.repo.stash_foreach(|_, message, _| {
            messages.push(message.to_string());
            true
        })?;

        Ok(messages)
    }
}
