#[cfg(not(windows))]
mod fuzz {
    use std::io::Cursor;

    use avbchain::{
        format::{avb::Descriptor, vbmeta::VbmetaImage},
        partition::PartitionInfo,
        stream::FromReader,
    };
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let _ = VbmetaImage::from_reader(Cursor::new(data));
                let _ = Descriptor::read_all(data);

                if let Ok(Some(info)) = PartitionInfo::probe(Cursor::new(data)) {
                    if let Some(offset) = usize::try_from(info.vbmeta_offset)
                        .ok()
                        .filter(|o| *o <= data.len())
                    {
                        let _ = VbmetaImage::from_reader(Cursor::new(&data[offset..]));
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
