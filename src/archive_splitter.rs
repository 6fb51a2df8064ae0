//! Splits archives into their component members so that later stages can treat every input
//! uniformly as "the bytes of one relocatable object".

use crate::archive;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::InputData;
use crate::input_data::InputRef;
use anyhow::Context;

pub(crate) struct InputBytes<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) data: &'data [u8],

    /// Whether this object came out of an archive. Archive members don't contribute to the link
    /// unless something references a symbol they define.
    pub(crate) from_archive: bool,
}

#[tracing::instrument(skip_all, name = "Split archives")]
pub(crate) fn split_archives<'data>(
    input_data: &'data InputData,
) -> Result<Vec<InputBytes<'data>>> {
    let mut outputs = Vec::new();
    for file in &input_data.files {
        match file.kind {
            FileKind::ElfObject => outputs.push(InputBytes {
                input: InputRef { file, entry: None },
                data: file.data(),
                from_archive: false,
            }),
            FileKind::Archive => {
                // Every member is read eagerly. That's faster when most members end up being
                // needed anyway, and it means the archive's symbol index can't go stale on us.
                let members = archive::parse_members(file.data()).with_context(|| {
                    format!("Failed to read archive `{}`", file.filename.display())
                })?;
                for member in members {
                    outputs.push(InputBytes {
                        input: InputRef {
                            file,
                            entry: Some(member.name),
                        },
                        data: member.data,
                        from_archive: true,
                    });
                }
            }
        }
    }
    Ok(outputs)
}
