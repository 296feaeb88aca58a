//! Rendering of the files that drive one external build.
//!
//! Every value interpolated into a shell script goes through [`shell_quote`],
//! so paths and identifiers can never break out of their argument position.

use std::path::Path;

use crate::job::{EXIT_CODE_FILE, JobPaths, RUNNING_MARKER, STDERR_FILE, STDOUT_FILE};

/// Taxonomy release tag used to name pruned taxonomy copies.
pub const TAXONOMY_TAG: &str = "3.2";

const CLEANING_FLAGS: &str = "major_rank_conflict,major_rank_conflict_inherited,environmental,\
viral,barren,not_otu,hidden,was_container,inconsistent,hybrid,merged";
const REGRAFTING_FLAGS: &str = "extinct_inherited,extinct";

/// Everything the build script needs to know.
#[derive(Debug, Clone)]
pub struct BuildScriptParams<'a> {
    pub paths: &'a JobPaths,
    pub root_ott_id: u64,
    pub build_tool_dir: &'a Path,
    pub taxonomy_dir: &'a Path,
    pub base_config_file: &'a Path,
    pub env_file: Option<&'a Path>,
}

/// Quote a string for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | ':' | ','))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// The synthesis settings handed to the build tool.
pub fn render_var_config(collections: &[String], root_ott_id: u64, id: &str) -> String {
    format!(
        "[taxonomy]\n\
         cleaning_flags = {CLEANING_FLAGS}\n\
         additional_regrafting_flags = {REGRAFTING_FLAGS}\n\
         \n\
         [synthesis]\n\
         collections = {collections}\n\
         root_ott_id = {root_ott_id}\n\
         synth_id = custom_{id}\n",
        collections = collections.join(","),
    )
}

/// The per-job build script (`<id>.bash`).
///
/// Prunes the taxonomy at the root taxon, runs the build, and if the build
/// failed only because extinct taxa need bumping, patches the taxonomy and
/// rebuilds once. On success the results directory is archived.
pub fn render_build_script(params: &BuildScriptParams<'_>) -> String {
    let paths = params.paths;
    let dir = quote_path(paths.dir());
    let id = paths.id();
    let root = params.root_ott_id;
    let tool_bin = params.build_tool_dir.join("bin");
    let build_at_dir = quote_path(&tool_bin.join("build_at_dir.sh"));
    let verify_edits = quote_path(&tool_bin.join("verify_taxon_edits_not_needed.py"));
    let patch_bump = quote_path(&tool_bin.join("patch_taxonomy_by_bumping.py"));
    let base_config = quote_path(params.base_config_file);
    let taxonomy = quote_path(params.taxonomy_dir);
    let var_config = quote_path(&paths.var_config());
    let results = quote_path(&paths.results_dir());
    let pre_bump = quote_path(&paths.dir().join(format!("pre_bump_custom_{}", id)));
    let pruned_path = paths
        .dir()
        .join(format!("ott{}_pruned_{}", TAXONOMY_TAG, root));
    let pruned = quote_path(&pruned_path);
    let bumped_path = paths.dir().join(format!("ott{}_bumped_{}", TAXONOMY_TAG, id));
    let bumped = quote_path(&bumped_path);
    let flagged_ini = quote_path(&paths.dir().join("extinct_flagged.ini"));
    let bumped_ini = quote_path(&paths.dir().join("extinct_bumped.ini"));
    let move_log = quote_path(
        &paths
            .results_dir()
            .join("cleaned_ott")
            .join("move_extinct_higher_log.json"),
    );
    let archive = quote_path(&paths.dir().join(format!("{}.tar.gz", id)));
    let results_name = shell_quote(&format!("custom_{}", id));
    let ott_line_flagged = shell_quote(&format!("ott = {}", pruned_path.to_string_lossy()));
    let ott_line_bumped = shell_quote(&format!("ott = {}", bumped_path.to_string_lossy()));

    let mut script = String::from("#!/bin/bash\nset -x\n");
    if let Some(env_file) = params.env_file {
        script.push_str(&format!("source {}\n", quote_path(env_file)));
    }
    script.push_str(&format!("cd {dir} || exit 1\n\n"));
    script.push_str(&format!(
        "# Prune the taxonomy to the root of this subproblem\n\
         otc-taxonomy-parser -r {root} -E --write-taxonomy {pruned} {taxonomy} || exit 1\n\n\
         cp {base_config} {flagged_ini} || exit 1\n\
         echo {ott_line_flagged} >> {flagged_ini} || exit 1\n\n\
         export OTC_CONFIG={flagged_ini}\n\
         if ! {build_at_dir} {var_config} {results}\n\
         then\n\
         \x20   if {verify_edits} {move_log}\n\
         \x20   then\n\
         \x20       echo 'build failed for reason other than need of taxon bump'\n\
         \x20       exit 1\n\
         \x20   fi\n\
         \x20   {patch_bump} {pruned} {move_log} {bumped} || exit 1\n\
         \x20   cp {base_config} {bumped_ini} || exit 1\n\
         \x20   echo {ott_line_bumped} >> {bumped_ini} || exit 1\n\
         \x20   export OTC_CONFIG={bumped_ini}\n\
         \x20   mv {results} {pre_bump} || exit 1\n\
         \x20   {build_at_dir} {var_config} {results} || exit 1\n\
         fi\n\n\
         tar -czf {archive} -C {dir} {results_name} || exit 1\n"
    ));
    script
}

/// The wrapper the launcher worker spawns (`launcher.bash`).
///
/// Maintains the liveness marker around the build, captures its output, and
/// publishes the exit code through a rename so pollers never read a partial
/// value.
pub fn render_launcher_script(paths: &JobPaths) -> String {
    let dir = quote_path(paths.dir());
    let build_script = quote_path(&paths.build_script());
    format!(
        "#!/bin/bash\n\
         cd {dir} || exit 1\n\
         echo \"$$\" > {RUNNING_MARKER}\n\
         finish() {{\n\
         \x20   echo \"$1\" > {EXIT_CODE_FILE}.tmp\n\
         \x20   mv {EXIT_CODE_FILE}.tmp {EXIT_CODE_FILE}\n\
         \x20   rm -f {RUNNING_MARKER}\n\
         }}\n\
         trap 'kill \"$build\" 2>/dev/null; finish 130; exit 130' INT\n\
         trap 'kill \"$build\" 2>/dev/null; finish 143; exit 143' TERM\n\
         bash {build_script} > {STDOUT_FILE} 2> {STDERR_FILE} &\n\
         build=$!\n\
         wait \"$build\"\n\
         rc=$?\n\
         finish \"$rc\"\n\
         exit \"$rc\"\n"
    )
}
